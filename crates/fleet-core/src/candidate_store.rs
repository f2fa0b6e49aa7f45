//! Candidate publication in the manifest-versions repository.
//!
//! Candidates are spec files at `<candidate_root>/buildspecs/<chrome
//! branch>/<version>.xml`. A publish writes one new spec on a throwaway
//! branch, commits and pushes it. When the push is rejected because
//! another publisher got there first, the clone is refreshed and the next
//! free version is recomputed, so two publishers never share a version.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_state::ContentDigest;
use tracing::{debug, info};

use crate::checkout::SourceCheckout;
use crate::config::CoordinatorConfig;
use crate::error::{CoreError, Result};
use crate::git::{capture_head_sha, GitOps, PushOutcome};
use crate::manifest::{Manifest, PendingPatch};
use crate::obs;
use crate::version::VersionNumber;

const BUILDSPECS_DIR: &str = "buildspecs";
const SPEC_EXTENSION: &str = "xml";

/// A published candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub version: VersionNumber,
    pub path: PathBuf,
    pub manifest: Manifest,
}

/// The next version to publish for `base`, given what is already published.
///
/// Only candidates of the same base count; the first candidate of a base
/// is `rc1`.
pub fn next_candidate_version(base: &VersionNumber, published: &[VersionNumber]) -> Result<VersionNumber> {
    let first = base.base().as_candidate();
    let latest = published
        .iter()
        .filter(|v| v.same_base(base) && v.is_candidate())
        .max();
    let next = match latest {
        Some(latest) if *latest >= first => latest.increment()?,
        _ => first,
    };
    Ok(match base.chrome_branch() {
        Some(branch) => next.with_chrome_branch(branch),
        None => next,
    })
}

/// Publishes and reads candidate specs through a local clone.
pub struct CandidateStore {
    config: Arc<CoordinatorConfig>,
    checkout: Arc<dyn SourceCheckout>,
    git: Arc<dyn GitOps>,
}

impl CandidateStore {
    pub fn new(
        config: Arc<CoordinatorConfig>,
        checkout: Arc<dyn SourceCheckout>,
        git: Arc<dyn GitOps>,
    ) -> Self {
        Self {
            config,
            checkout,
            git,
        }
    }

    /// Bring the local clone to the remote tip, discarding local state.
    pub async fn refresh(&self) -> Result<()> {
        self.git
            .refresh(
                &self.config.manifest_dir,
                &self.config.manifest_repo_url,
                &self.config.branch,
            )
            .await
    }

    pub fn specs_dir(&self, chrome_branch: u32) -> PathBuf {
        self.config
            .candidate_root()
            .join(BUILDSPECS_DIR)
            .join(chrome_branch.to_string())
    }

    pub fn spec_path(&self, version: &VersionNumber) -> Result<PathBuf> {
        let branch = version.require_chrome_branch()?;
        Ok(self
            .specs_dir(branch)
            .join(format!("{version}.{SPEC_EXTENSION}")))
    }

    /// Fails when the clone has no candidate root at all.
    ///
    /// An empty or absent branch directory is fine: it just means nothing
    /// has been published for that chrome branch yet.
    pub fn require_publish_root(&self) -> Result<()> {
        let root = self.config.candidate_root();
        if root.is_dir() {
            Ok(())
        } else {
            Err(CoreError::PublishDirectoryMissing(root))
        }
    }

    /// Every parseable spec version for `chrome_branch`, ascending.
    pub fn published_versions(&self, chrome_branch: u32) -> Result<Vec<VersionNumber>> {
        let dir = self.specs_dir(chrome_branch);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SPEC_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match stem.parse::<VersionNumber>() {
                Ok(v) => versions.push(v.with_chrome_branch(chrome_branch)),
                Err(_) => debug!(file = %path.display(), "ignoring unparseable spec name"),
            }
        }
        versions.sort();
        Ok(versions)
    }

    pub fn latest_candidate(&self, chrome_branch: u32) -> Result<Option<VersionNumber>> {
        Ok(self.published_versions(chrome_branch)?.pop())
    }

    /// Path of a published spec in the local clone.
    ///
    /// A version without a chrome branch is looked up under every branch.
    pub fn local_manifest(&self, version: &VersionNumber) -> Result<PathBuf> {
        let not_found = || CoreError::CandidateNotFound(version.to_string());
        if version.chrome_branch().is_some() {
            let path = self.spec_path(version)?;
            return if path.is_file() { Ok(path) } else { Err(not_found()) };
        }

        let specs = self.config.candidate_root().join(BUILDSPECS_DIR);
        let entries = match std::fs::read_dir(&specs) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let file_name = format!("{version}.{SPEC_EXTENSION}");
        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path().join(&file_name);
            if path.is_file() {
                found.push(path);
            }
        }
        found.sort();
        found.pop().ok_or_else(not_found)
    }

    /// Load a published spec; the result carries the chrome branch it was found under.
    pub fn load_candidate(&self, version: &VersionNumber) -> Result<Candidate> {
        let path = self.local_manifest(version)?;
        let manifest = Manifest::load(&path)?;
        let chrome_branch = path
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<u32>().ok());
        let version = match chrome_branch {
            Some(branch) => version.clone().with_chrome_branch(branch),
            None => version.clone(),
        };
        Ok(Candidate {
            version,
            path,
            manifest,
        })
    }

    /// Whether the checkout is exactly what `latest` already pinned.
    async fn already_built(&self, latest: &VersionNumber) -> Result<bool> {
        let path = self.spec_path(latest)?;
        let manifest = Manifest::load(&path)?;
        self.checkout.matches_manifest(&manifest).await
    }

    /// Publish the checkout, with `patches` applied, as the next candidate.
    ///
    /// Returns `None` without publishing when there are no patches, `force`
    /// is off and the latest published candidate pins exactly the revisions
    /// the checkout is at.
    pub async fn create_new_candidate(
        &self,
        patches: &[PendingPatch],
        tool_version: Option<&str>,
    ) -> Result<Option<Candidate>> {
        let attempts = self.config.publish_retries + 1;
        let mut last_version = None;

        for attempt in 1..=attempts {
            self.refresh().await?;
            let base = self.checkout.current_version().await?;
            let chrome_branch = base.require_chrome_branch()?;
            let published = self.published_versions(chrome_branch)?;

            if patches.is_empty() && !self.config.force {
                if let Some(latest) = published.last() {
                    if self.already_built(latest).await? {
                        obs::emit_candidate_skipped(&self.config.build_name, &latest.to_string());
                        return Ok(None);
                    }
                }
            }

            let version = next_candidate_version(&base, &published)?;
            let _span = obs::CandidateSpan::enter(&self.config.build_name, &version.to_string());

            let mut manifest = self.checkout.export_manifest().await?;
            if let Some(tool_version) = tool_version {
                manifest.stamp_tool_version(tool_version);
            }
            manifest.inject_patches(patches);

            let message = format!(
                "Automatic: Start {} {} {}",
                self.config.build_name, self.config.branch, version
            );
            match self.publish(&version, &manifest, &message).await? {
                PushOutcome::Pushed => {
                    self.emit_published(&version, attempt);
                    return Ok(Some(Candidate {
                        path: self.spec_path(&version)?,
                        version,
                        manifest,
                    }));
                }
                PushOutcome::Rejected => {
                    obs::emit_publish_rejected(&version.to_string(), attempt);
                    last_version = Some(version);
                }
            }
        }

        Err(CoreError::PublishExhausted {
            what: last_version.map(|v| v.to_string()).unwrap_or_default(),
            attempts,
        })
    }

    /// Publish an existing manifest under the version its file is named after.
    ///
    /// External builders publish it with internal-only projects removed.
    pub async fn create_from_manifest(&self, source: &Path) -> Result<Candidate> {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| CoreError::CandidateNotFound(source.display().to_string()))?;
        let named: VersionNumber = stem.parse()?;

        let mut manifest = Manifest::load(source)?;
        if !self.config.internal {
            manifest = manifest.filter_internal_projects(&self.config.whitelisted_remotes)?;
        }

        let attempts = self.config.publish_retries + 1;
        for attempt in 1..=attempts {
            self.refresh().await?;
            let chrome_branch = self
                .checkout
                .current_version()
                .await?
                .require_chrome_branch()?;
            let version = named.clone().with_chrome_branch(chrome_branch);
            let message = format!(
                "Automatic: {} publishing {} from {}",
                self.config.build_name,
                version,
                source.display()
            );
            match self.publish(&version, &manifest, &message).await? {
                PushOutcome::Pushed => {
                    self.emit_published(&version, attempt);
                    return Ok(Candidate {
                        path: self.spec_path(&version)?,
                        version,
                        manifest,
                    });
                }
                PushOutcome::Rejected => obs::emit_publish_rejected(&version.to_string(), attempt),
            }
        }

        Err(CoreError::PublishExhausted {
            what: named.to_string(),
            attempts,
        })
    }

    /// Copy the spec of `version` to the LKGM path and push it.
    pub async fn promote_candidate(&self, version: &VersionNumber) -> Result<PathBuf> {
        let lkgm = self.config.lkgm_path();
        let attempts = self.config.publish_retries + 1;

        for attempt in 1..=attempts {
            self.refresh().await?;
            let candidate = self.load_candidate(version)?;
            let xml = candidate.manifest.to_xml()?;
            let digest = ContentDigest::from_bytes(xml.as_bytes());
            if ContentDigest::of_file(&lkgm)?.as_ref() == Some(&digest) {
                info!(version = %version, digest = digest.short(), "LKGM already at candidate");
                return Ok(lkgm);
            }

            self.git
                .create_push_branch(&self.config.manifest_dir, &self.config.branch)
                .await?;
            write_atomically(&lkgm, xml.as_bytes())?;
            let message = format!(
                "Automatic: {} promoting {} to LKGM",
                self.config.build_name, version
            );
            if !self
                .git
                .commit_all(&self.config.manifest_dir, &message)
                .await?
            {
                info!(version = %version, "LKGM already at candidate");
                return Ok(lkgm);
            }

            match self
                .git
                .push(&self.config.manifest_dir, &self.config.branch, self.config.dry_run)
                .await?
            {
                PushOutcome::Pushed => {
                    obs::emit_candidate_promoted(&version.to_string(), &digest);
                    return Ok(lkgm);
                }
                PushOutcome::Rejected => obs::emit_publish_rejected(&version.to_string(), attempt),
            }
        }

        Err(CoreError::PublishExhausted {
            what: format!("LKGM {version}"),
            attempts,
        })
    }

    fn emit_published(&self, version: &VersionNumber, attempt: u32) {
        let commit = capture_head_sha(&self.config.manifest_dir).ok();
        obs::emit_candidate_published(
            &self.config.build_name,
            &version.to_string(),
            commit.as_deref(),
            attempt,
        );
    }

    /// Write `manifest` as the spec of `version` and push it once.
    async fn publish(&self, version: &VersionNumber, manifest: &Manifest, message: &str) -> Result<PushOutcome> {
        let repo = &self.config.manifest_dir;
        self.git.create_push_branch(repo, &self.config.branch).await?;

        let path = self.spec_path(version)?;
        if path.exists() {
            return Err(CoreError::CandidateExists(version.to_string()));
        }
        write_atomically(&path, manifest.to_xml()?.as_bytes())?;

        if !self.git.commit_all(repo, message).await? {
            return Err(CoreError::Git(format!("nothing to commit for {version}")));
        }
        self.git.push(repo, &self.config.branch, self.config.dry_run).await
    }
}

/// Write `bytes` to `path` via a temp file in the same directory.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionNumber {
        s.parse().unwrap()
    }

    #[test]
    fn first_candidate_is_rc1() {
        let base = v("5100.0.0").with_chrome_branch(32);
        let next = next_candidate_version(&base, &[]).unwrap();
        assert_eq!(next.to_string(), "5100.0.0-rc1");
        assert_eq!(next.chrome_branch(), Some(32));
    }

    #[test]
    fn next_follows_latest_of_same_base() {
        let base = v("5100.0.0");
        let published = vec![v("5099.0.0-rc7"), v("5100.0.0-rc1"), v("5100.0.0-rc2"), v("5101.0.0-rc1")];
        assert_eq!(
            next_candidate_version(&base, &published).unwrap().to_string(),
            "5100.0.0-rc3"
        );
    }

    #[test]
    fn release_specs_do_not_count() {
        let base = v("5100.0.0");
        let published = vec![v("5100.0.0")];
        assert_eq!(
            next_candidate_version(&base, &published).unwrap().to_string(),
            "5100.0.0-rc1"
        );
    }

    #[test]
    fn write_atomically_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/spec.xml");
        write_atomically(&path, b"<manifest/>").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"<manifest/>");
        write_atomically(&path, b"<manifest></manifest>").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"<manifest></manifest>");
    }
}
