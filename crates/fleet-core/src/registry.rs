//! Builder registry.
//!
//! Builder configs are plain records. Inheritance happens once, at load
//! time: each entry starts from [`BuilderConfig::default`], applies its
//! templates in order and then its own overrides. The resulting
//! [`BuilderRegistry`] is immutable.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::BuildType;
use crate::error::{CoreError, Result};

/// Which overlays a builder checks out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overlays {
    Public,
    Private,
    Both,
}

/// Static description of one builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: String,
    pub boards: Vec<String>,
    pub build_type: BuildType,
    /// Runs on a release branch rather than ToT.
    pub branch: bool,
    /// Publishes candidates and aggregates slave results.
    pub master: bool,
    /// Its result counts towards the master's verdict.
    pub important: bool,
    pub internal: bool,
    /// Builds from published candidate manifests.
    pub manifest_version: bool,
    pub chrome_rev: Option<String>,
    pub overlays: Overlays,
    /// Slaves whose failure alone does not fail the master.
    pub sanity_check_slaves: Vec<String>,
    pub manifest_repo_url: Option<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            boards: Vec::new(),
            build_type: BuildType::Pfq,
            branch: false,
            master: false,
            important: false,
            internal: false,
            manifest_version: false,
            chrome_rev: None,
            overlays: Overlays::Public,
            sanity_check_slaves: Vec::new(),
            manifest_repo_url: None,
        }
    }
}

/// Fields a template or entry may set. `None` leaves the parent's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    pub boards: Option<Vec<String>>,
    pub build_type: Option<BuildType>,
    pub branch: Option<bool>,
    pub master: Option<bool>,
    pub important: Option<bool>,
    pub internal: Option<bool>,
    pub manifest_version: Option<bool>,
    pub chrome_rev: Option<String>,
    pub overlays: Option<Overlays>,
    pub sanity_check_slaves: Option<Vec<String>>,
    pub manifest_repo_url: Option<String>,
}

impl BuilderConfig {
    /// A copy of `self` with `overrides` applied.
    pub fn derive(&self, overrides: &ConfigOverrides) -> BuilderConfig {
        let o = overrides.clone();
        BuilderConfig {
            name: self.name.clone(),
            boards: o.boards.unwrap_or_else(|| self.boards.clone()),
            build_type: o.build_type.unwrap_or(self.build_type),
            branch: o.branch.unwrap_or(self.branch),
            master: o.master.unwrap_or(self.master),
            important: o.important.unwrap_or(self.important),
            internal: o.internal.unwrap_or(self.internal),
            manifest_version: o.manifest_version.unwrap_or(self.manifest_version),
            chrome_rev: o.chrome_rev.or_else(|| self.chrome_rev.clone()),
            overlays: o.overlays.unwrap_or(self.overlays),
            sanity_check_slaves: o
                .sanity_check_slaves
                .unwrap_or_else(|| self.sanity_check_slaves.clone()),
            manifest_repo_url: o
                .manifest_repo_url
                .or_else(|| self.manifest_repo_url.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    templates: BTreeMap<String, ConfigOverrides>,
    #[serde(default)]
    builders: Vec<BuilderEntry>,
}

#[derive(Debug, Deserialize)]
struct BuilderEntry {
    name: String,
    #[serde(default)]
    templates: Vec<String>,
    #[serde(flatten)]
    overrides: ConfigOverrides,
}

/// Immutable set of builder configs, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct BuilderRegistry {
    builders: BTreeMap<String, BuilderConfig>,
}

impl BuilderRegistry {
    pub fn new(configs: impl IntoIterator<Item = BuilderConfig>) -> Result<Self> {
        let mut builders = BTreeMap::new();
        for config in configs {
            if config.name.is_empty() {
                return Err(CoreError::Config("builder with empty name".to_string()));
            }
            if let Some(dup) = builders.insert(config.name.clone(), config) {
                return Err(CoreError::Config(format!("duplicate builder {}", dup.name)));
            }
        }
        Ok(Self { builders })
    }

    /// Load from TOML with `[templates.<name>]` tables and `[[builders]]` entries.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))?;

        let mut configs = Vec::with_capacity(file.builders.len());
        for entry in file.builders {
            let mut config = BuilderConfig::default();
            for template in &entry.templates {
                let overrides = file.templates.get(template).ok_or_else(|| {
                    CoreError::Config(format!(
                        "builder {} uses unknown template {template}",
                        entry.name
                    ))
                })?;
                config = config.derive(overrides);
            }
            config = config.derive(&entry.overrides);
            config.name = entry.name;
            configs.push(config);
        }
        Self::new(configs)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn get(&self, name: &str) -> Option<&BuilderConfig> {
        self.builders.get(name)
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuilderConfig> {
        self.builders.values()
    }

    /// Slaves of the builder named `name`, which must be a master that uses
    /// manifest versioning.
    pub fn slaves_for_master(&self, name: &str) -> Result<Vec<&BuilderConfig>> {
        let master = self
            .get(name)
            .ok_or_else(|| CoreError::Config(format!("no builder named {name}")))?;
        if !master.master || !master.manifest_version {
            return Err(CoreError::Config(format!(
                "{name} is not a manifest-versioned master"
            )));
        }
        Ok(self.slaves_of(master))
    }

    /// Builders whose results `master` waits for.
    pub fn slaves_of(&self, master: &BuilderConfig) -> Vec<&BuilderConfig> {
        self.builders
            .values()
            .filter(|b| {
                b.important
                    && b.manifest_version
                    && (!b.master || !b.boards.is_empty())
                    && b.build_type == master.build_type
                    && b.chrome_rev == master.chrome_rev
                    && b.branch == master.branch
            })
            .collect()
    }
}
