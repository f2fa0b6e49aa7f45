//! Candidate manifest model and content transforms.
//!
//! The manifest is the on-the-wire contract with every builder, so it is
//! kept as a generic, order-preserving element tree: elements and
//! attributes this crate does not know about survive a parse/write cycle.
//! Comments, processing instructions and text content do not; manifests
//! carry all their data in attributes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

pub const MANIFEST_ELEMENT: &str = "manifest";
pub const DEFAULT_ELEMENT: &str = "default";
pub const PROJECT_ELEMENT: &str = "project";
pub const PENDING_COMMIT_ELEMENT: &str = "pending_commit";
pub const CHROME_ELEMENT: &str = "chrome";
pub const CHROME_VERSION_ATTR: &str = "version";

/// Errors produced while reading or transforming a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("xml error: {0}")]
    Xml(String),

    #[error("document root is <{0}>, expected <manifest>")]
    NotAManifest(String),

    #[error("more than one <default> element found in manifest ({0})")]
    MultipleDefaults(usize),

    #[error("project {0} has unspecified remote with no default")]
    NoDefaultRemote(String),

    #[error("<{element}> is missing required attribute {attribute}")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("attribute {attribute} has invalid value {value:?}")]
    InvalidAttribute { attribute: &'static str, value: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<quick_xml::Error> for ManifestError {
    fn from(err: quick_xml::Error) -> Self {
        ManifestError::Xml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ManifestError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        ManifestError::Xml(err.to_string())
    }
}

pub type ManifestResult<T> = std::result::Result<T, ManifestError>;

/// One XML element with its attributes in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, keeping its position if it already exists.
    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    fn required(&self, element: &'static str, key: &'static str) -> ManifestResult<&str> {
        self.attr(key).ok_or(ManifestError::MissingAttribute {
            element,
            attribute: key,
        })
    }

    fn from_start(start: &BytesStart<'_>) -> ManifestResult<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut element = Element::new(name);
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    fn write_to(&self, writer: &mut Writer<Vec<u8>>) -> ManifestResult<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attributes {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
        } else {
            writer.write_event(Event::Start(start))?;
            for child in &self.children {
                child.write_to(writer)?;
            }
            writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        }
        Ok(())
    }
}

/// A `<project>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub path: Option<String>,
    pub revision: Option<String>,
    pub remote: Option<String>,
}

impl Project {
    /// Checkout path relative to the source root; defaults to the name.
    pub fn checkout_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

/// A change under test, injected as a `<pending_commit>` element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingPatch {
    pub remote: String,
    pub gerrit_number: String,
    pub project: String,
    pub project_url: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub branch: String,
    pub change_id: String,
    pub commit: String,
    pub patch_number: String,
    pub owner_email: String,
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default)]
    pub pass_count: u32,
    #[serde(default)]
    pub total_fail_count: u32,
}

impl PendingPatch {
    pub fn to_element(&self) -> Element {
        Element::new(PENDING_COMMIT_ELEMENT)
            .with_attr("remote", &self.remote)
            .with_attr("gerrit_number", &self.gerrit_number)
            .with_attr("project", &self.project)
            .with_attr("project_url", &self.project_url)
            .with_attr("ref", &self.ref_name)
            .with_attr("branch", &self.branch)
            .with_attr("change_id", &self.change_id)
            .with_attr("commit", &self.commit)
            .with_attr("patch_number", &self.patch_number)
            .with_attr("owner_email", &self.owner_email)
            .with_attr("fail_count", self.fail_count.to_string())
            .with_attr("pass_count", self.pass_count.to_string())
            .with_attr("total_fail_count", self.total_fail_count.to_string())
    }

    pub fn from_element(el: &Element) -> ManifestResult<Self> {
        let text = |key: &'static str| -> String { el.attr(key).unwrap_or_default().to_string() };
        let count = |key: &'static str| -> ManifestResult<u32> {
            match el.attr(key) {
                None | Some("") => Ok(0),
                Some(v) => v.parse().map_err(|_| ManifestError::InvalidAttribute {
                    attribute: key,
                    value: v.to_string(),
                }),
            }
        };

        Ok(PendingPatch {
            remote: text("remote"),
            gerrit_number: text("gerrit_number"),
            project: el.required(PENDING_COMMIT_ELEMENT, "project")?.to_string(),
            project_url: text("project_url"),
            ref_name: text("ref"),
            branch: text("branch"),
            change_id: el.required(PENDING_COMMIT_ELEMENT, "change_id")?.to_string(),
            commit: el.required(PENDING_COMMIT_ELEMENT, "commit")?.to_string(),
            patch_number: text("patch_number"),
            owner_email: text("owner_email"),
            fail_count: count("fail_count")?,
            pass_count: count("pass_count")?,
            total_fail_count: count("total_fail_count")?,
        })
    }
}

/// A parsed manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    root: Element,
}

impl Manifest {
    /// An empty `<manifest/>`.
    pub fn new() -> Self {
        Self {
            root: Element::new(MANIFEST_ELEMENT),
        }
    }

    pub fn from_root(root: Element) -> ManifestResult<Self> {
        if root.name != MANIFEST_ELEMENT {
            return Err(ManifestError::NotAManifest(root.name));
        }
        Ok(Self { root })
    }

    pub fn parse(xml: &str) -> ManifestResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => stack.push(Element::from_start(e)?),
                Event::Empty(ref e) => {
                    let element = Element::from_start(e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ManifestError::Xml("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(ManifestError::Xml("unclosed element".to_string()));
        }
        let root = root.ok_or_else(|| ManifestError::Xml("empty document".to_string()))?;
        Self::from_root(root)
    }

    pub fn load(path: &Path) -> ManifestResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn to_xml(&self) -> ManifestResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        self.root.write_to(&mut writer)?;
        let mut xml = String::from_utf8(writer.into_inner())
            .map_err(|e| ManifestError::Xml(e.to_string()))?;
        xml.push('\n');
        Ok(xml)
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.root.children.iter().filter(move |c| c.name == name)
    }

    /// The remote declared by `<default>`, if any.
    pub fn default_remote(&self) -> ManifestResult<Option<&str>> {
        let defaults: Vec<&Element> = self.children_named(DEFAULT_ELEMENT).collect();
        match defaults.as_slice() {
            [] => Ok(None),
            [default] => Ok(default.attr("remote")),
            many => Err(ManifestError::MultipleDefaults(many.len())),
        }
    }

    pub fn projects(&self) -> ManifestResult<Vec<Project>> {
        self.children_named(PROJECT_ELEMENT)
            .map(|el| {
                Ok(Project {
                    name: el.required(PROJECT_ELEMENT, "name")?.to_string(),
                    path: el.attr("path").map(str::to_string),
                    revision: el.attr("revision").map(str::to_string),
                    remote: el.attr("remote").map(str::to_string),
                })
            })
            .collect()
    }

    pub fn pending_patches(&self) -> ManifestResult<Vec<PendingPatch>> {
        self.children_named(PENDING_COMMIT_ELEMENT)
            .map(PendingPatch::from_element)
            .collect()
    }

    /// Version recorded by the `<chrome>` stamp.
    pub fn chrome_version(&self) -> Option<&str> {
        self.children_named(CHROME_ELEMENT)
            .last()
            .and_then(|el| el.attr(CHROME_VERSION_ATTR))
    }

    /// Checkout path → pinned revision for every project.
    pub fn revisions(&self) -> ManifestResult<BTreeMap<String, String>> {
        Ok(self
            .projects()?
            .into_iter()
            .map(|p| {
                let path = p.checkout_path().to_string();
                (path, p.revision.unwrap_or_default())
            })
            .collect())
    }

    /// True when both manifests pin the same projects to the same revisions.
    pub fn same_revisions(&self, other: &Manifest) -> ManifestResult<bool> {
        Ok(self.revisions()? == other.revisions()?)
    }

    /// Drop every project whose effective remote is not whitelisted, and
    /// every pending commit that no longer names a remaining project.
    ///
    /// A project with no `remote` attribute inherits the `<default>` remote.
    pub fn filter_internal_projects(&self, whitelisted_remotes: &[String]) -> ManifestResult<Manifest> {
        let default_remote = self.default_remote()?;

        let mut kept_projects = BTreeSet::new();
        let mut children = Vec::with_capacity(self.root.children.len());
        for child in &self.root.children {
            if child.name == PROJECT_ELEMENT {
                let name = child.required(PROJECT_ELEMENT, "name")?;
                let remote = match child.attr("remote").filter(|r| !r.is_empty()) {
                    Some(remote) => remote,
                    None => default_remote
                        .ok_or_else(|| ManifestError::NoDefaultRemote(name.to_string()))?,
                };
                if !whitelisted_remotes.iter().any(|w| w == remote) {
                    continue;
                }
                kept_projects.insert(name.to_string());
            }
            children.push(child.clone());
        }

        children.retain(|child| {
            child.name != PENDING_COMMIT_ELEMENT
                || child
                    .attr("project")
                    .is_some_and(|p| kept_projects.contains(p))
        });

        Ok(Manifest {
            root: Element {
                children,
                ..self.root.clone()
            },
        })
    }

    /// Append one `<pending_commit>` per patch. Existing content is untouched.
    pub fn inject_patches(&mut self, patches: &[PendingPatch]) {
        self.root
            .children
            .extend(patches.iter().map(PendingPatch::to_element));
    }

    /// Record the tool version in a single `<chrome>` element.
    pub fn stamp_tool_version(&mut self, version: &str) {
        self.root.children.retain(|c| c.name != CHROME_ELEMENT);
        self.root
            .children
            .push(Element::new(CHROME_ELEMENT).with_attr(CHROME_VERSION_ATTR, version));
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn patch(project: &str, n: u32) -> PendingPatch {
        PendingPatch {
            remote: "cros".to_string(),
            gerrit_number: format!("{}", 1000 + n),
            project: project.to_string(),
            project_url: format!("https://review.example.org/{project}"),
            ref_name: format!("refs/changes/{:02}/{}/1", n % 100, 1000 + n),
            branch: "master".to_string(),
            change_id: format!("I{:040x}", n),
            commit: format!("{:040x}", n + 1),
            patch_number: "1".to_string(),
            owner_email: "dev@example.org".to_string(),
            fail_count: 1,
            pass_count: 0,
            total_fail_count: 3,
        }
    }

    /// Build a manifest with the given internal/external project counts and
    /// `commits` pending commits spread round-robin over all projects.
    fn fake_manifest(internal: usize, external: usize, commits: usize, default_remote: bool) -> Manifest {
        let mut root = Element::new(MANIFEST_ELEMENT)
            .with_attr("revision", "refs/heads/master");
        if default_remote {
            root.children
                .push(Element::new(DEFAULT_ELEMENT).with_attr("remote", "cros"));
        }
        root.children
            .push(Element::new("remote").with_attr("name", "cros"));

        let mut names = Vec::new();
        for i in 0..internal {
            let name = format!("chromeos/internal-{i}");
            root.children.push(
                Element::new(PROJECT_ELEMENT)
                    .with_attr("name", &name)
                    .with_attr("revision", format!("{i:040x}"))
                    .with_attr("remote", "cros-internal"),
            );
            names.push(name);
        }
        for i in 0..external {
            let name = format!("chromiumos/external-{i}");
            let mut el = Element::new(PROJECT_ELEMENT)
                .with_attr("name", &name)
                .with_attr("revision", format!("{:040x}", 10_000 + i));
            if !default_remote {
                el.set_attr("remote", if i % 2 == 0 { "cros" } else { "chromium" });
            }
            root.children.push(el);
            names.push(name);
        }

        let mut manifest = Manifest::from_root(root).unwrap();
        let patches: Vec<PendingPatch> = (0..commits)
            .map(|i| patch(&names[i % names.len()], i as u32))
            .collect();
        manifest.inject_patches(&patches);
        manifest
    }

    fn whitelist() -> Vec<String> {
        vec!["cros".to_string(), "chromium".to_string()]
    }

    #[test]
    fn parse_write_parse_is_stable() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest>
  <remote name="cros" fetch="https://chromium.googlesource.com"/>
  <default remote="cros" revision="refs/heads/master"/>
  <project name="chromiumos/platform/crosutils" path="src/scripts" revision="abc123"/>
  <project name="chromiumos/overlays/chromiumos-overlay" path="src/third_party/chromiumos-overlay" revision="def456">
    <annotation name="branch-mode" value="tot"/>
  </project>
  <chrome version="35.0.1863.0"/>
</manifest>
"#;
        let m = Manifest::parse(xml).unwrap();
        let again = Manifest::parse(&m.to_xml().unwrap()).unwrap();
        assert_eq!(m, again);
        assert_eq!(m.projects().unwrap().len(), 2);
        assert_eq!(m.projects().unwrap()[1].checkout_path(), "src/third_party/chromiumos-overlay");
        assert_eq!(m.root().children[3].children.len(), 1);
        assert_eq!(m.chrome_version(), Some("35.0.1863.0"));
        assert_eq!(m.default_remote().unwrap(), Some("cros"));
    }

    #[test]
    fn comments_are_dropped_but_unknown_elements_kept() {
        let xml = r#"<manifest>
  <!-- pinned by the release team -->
  <notice>text is not kept</notice>
  <project name="a" revision="1111"/>
</manifest>"#;
        let m = Manifest::parse(xml).unwrap();
        let written = m.to_xml().unwrap();
        assert!(!written.contains("pinned by the release team"));
        assert!(!written.contains("text is not kept"));
        assert_eq!(m.root().children.len(), 2);
        assert_eq!(m.root().children[0].name, "notice");
        assert_eq!(m.projects().unwrap()[0].name, "a");
    }

    #[test]
    fn attribute_escaping_survives_round_trip() {
        let mut root = Element::new(MANIFEST_ELEMENT);
        root.children.push(
            Element::new(PROJECT_ELEMENT)
                .with_attr("name", "a&b")
                .with_attr("revision", "\"quoted\" <tag>"),
        );
        let m = Manifest::from_root(root).unwrap();
        let back = Manifest::parse(&m.to_xml().unwrap()).unwrap();
        assert_eq!(back.projects().unwrap()[0].revision.as_deref(), Some("\"quoted\" <tag>"));
    }

    #[test]
    fn rejects_non_manifest_root() {
        assert!(matches!(
            Manifest::parse("<project name=\"x\"/>"),
            Err(ManifestError::NotAManifest(_))
        ));
        assert!(Manifest::parse("<manifest><project name=\"x\">").is_err());
    }

    #[test]
    fn filter_keeps_only_whitelisted_projects_and_their_commits() {
        let m = fake_manifest(20, 80, 100, false);
        let filtered = m.filter_internal_projects(&whitelist()).unwrap();

        let projects = filtered.projects().unwrap();
        assert_eq!(projects.len(), 80);
        let names: BTreeSet<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        for p in &projects {
            assert!(whitelist().iter().any(|w| Some(w.as_str()) == p.remote.as_deref()));
        }

        let commits = filtered.pending_patches().unwrap();
        assert_eq!(commits.len(), 80);
        assert!(commits.iter().all(|c| names.contains(c.project.as_str())));
    }

    #[test]
    fn filter_without_internal_projects_is_identity() {
        let m = fake_manifest(0, 100, 20, false);
        let filtered = m.filter_internal_projects(&whitelist()).unwrap();
        assert_eq!(filtered, m);
    }

    #[test]
    fn filter_inherits_default_remote() {
        let m = fake_manifest(20, 80, 20, true);
        let filtered = m.filter_internal_projects(&whitelist()).unwrap();
        assert_eq!(filtered.projects().unwrap().len(), 80);
    }

    #[test]
    fn filter_is_idempotent() {
        let m = fake_manifest(7, 13, 40, true);
        let once = m.filter_internal_projects(&whitelist()).unwrap();
        let twice = once.filter_internal_projects(&whitelist()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.to_xml().unwrap(), twice.to_xml().unwrap());
    }

    #[test]
    fn filter_rejects_multiple_defaults() {
        let mut m = fake_manifest(1, 1, 0, true);
        m.root
            .children
            .push(Element::new(DEFAULT_ELEMENT).with_attr("remote", "cros"));
        assert!(matches!(
            m.filter_internal_projects(&whitelist()),
            Err(ManifestError::MultipleDefaults(2))
        ));
    }

    #[test]
    fn filter_rejects_remote_less_project_without_default() {
        let mut root = Element::new(MANIFEST_ELEMENT);
        root.children
            .push(Element::new(PROJECT_ELEMENT).with_attr("name", "orphan"));
        let m = Manifest::from_root(root).unwrap();
        assert!(matches!(
            m.filter_internal_projects(&whitelist()),
            Err(ManifestError::NoDefaultRemote(name)) if name == "orphan"
        ));
    }

    #[test]
    fn inject_patches_writes_every_attribute() {
        let mut m = fake_manifest(0, 2, 0, true);
        let before = m.projects().unwrap();
        let p = patch("chromiumos/external-1", 7);
        m.inject_patches(std::slice::from_ref(&p));

        assert_eq!(m.projects().unwrap(), before);
        let el = m
            .root()
            .children
            .iter()
            .find(|c| c.name == PENDING_COMMIT_ELEMENT)
            .unwrap();
        let keys: Vec<&str> = el.attributes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            [
                "remote", "gerrit_number", "project", "project_url", "ref", "branch", "change_id",
                "commit", "patch_number", "owner_email", "fail_count", "pass_count",
                "total_fail_count",
            ]
        );
        assert_eq!(el.attr("total_fail_count"), Some("3"));

        let reparsed = Manifest::parse(&m.to_xml().unwrap()).unwrap();
        assert_eq!(reparsed.pending_patches().unwrap(), vec![p]);
    }

    #[test]
    fn stamp_replaces_instead_of_duplicating() {
        let mut m = fake_manifest(0, 1, 0, true);
        m.stamp_tool_version("35.0.1863.0");
        m.stamp_tool_version("35.0.1864.0");
        let stamps = m
            .root()
            .children
            .iter()
            .filter(|c| c.name == CHROME_ELEMENT)
            .count();
        assert_eq!(stamps, 1);
        assert_eq!(m.chrome_version(), Some("35.0.1864.0"));
    }

    #[test]
    fn revisions_ignore_annotations() {
        let a = fake_manifest(2, 2, 0, true);
        let mut b = a.clone();
        b.stamp_tool_version("1.0");
        b.inject_patches(&[patch("chromiumos/external-0", 1)]);
        assert!(a.same_revisions(&b).unwrap());
        assert_ne!(a.to_xml().unwrap(), b.to_xml().unwrap());
    }
}
