//! Coordinator configuration.
//!
//! [`CoordinatorConfig`] is loaded from TOML or assembled with
//! [`CoordinatorConfig::builder`]; either way it is validated before use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::version::IncrType;

/// Subdirectory of the manifest repository holding the LKGM.
pub const LKGM_PATH: &str = "LKGM/lkgm.xml";

/// Remotes whose projects may appear in an external manifest.
pub const EXTERNAL_REMOTES: [&str; 2] = ["cros", "chromium"];

/// Accounts that land changes through the commit queue.
pub const TRUSTED_COMMITTERS: [&str; 3] = ["chrome-bot", "chrome-internal-fetch", "chromeos-commit-bot"];

const DEFAULT_VERSION_FILE: &str = "src/third_party/chromiumos-overlay/chromeos/config/chromeos_version.sh";

/// Kind of build a builder runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildType {
    Pfq,
    ChromePfq,
    CommitQueue,
    Canary,
    Full,
}

impl BuildType {
    /// Builds that publish and consume LKGM candidates.
    pub fn is_pfq_type(self) -> bool {
        matches!(
            self,
            BuildType::Pfq | BuildType::ChromePfq | BuildType::CommitQueue
        )
    }

    /// Directory under the manifest repository holding this type's candidates.
    pub fn candidate_subdir(self) -> Option<&'static str> {
        match self {
            BuildType::Pfq => Some("LKGM-candidates"),
            BuildType::ChromePfq => Some("chrome-LKGM-candidates"),
            BuildType::CommitQueue => Some("paladin"),
            BuildType::Canary | BuildType::Full => None,
        }
    }

    /// How long slaves wait for a candidate, and masters for slaves.
    pub fn default_long_timeout(self) -> Duration {
        match self {
            BuildType::Pfq => Duration::from_secs(20 * 60),
            _ => Duration::from_secs(3 * 60 * 60),
        }
    }
}

/// Where builder status artifacts live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusStoreConfig {
    Fs { root: PathBuf },
    Http { base_url: String },
}

fn default_incr_type() -> IncrType {
    IncrType::Build
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_whitelisted_remotes() -> Vec<String> {
    EXTERNAL_REMOTES.iter().map(|r| r.to_string()).collect()
}

fn default_trusted_committers() -> Vec<String> {
    TRUSTED_COMMITTERS.iter().map(|c| c.to_string()).collect()
}

fn default_publish_retries() -> u32 {
    20
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_short_timeout_secs() -> u64 {
    3 * 60
}

fn default_version_file() -> PathBuf {
    PathBuf::from(DEFAULT_VERSION_FILE)
}

/// Everything one coordinator instance needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Builder that owns this run.
    pub build_name: String,
    pub build_type: BuildType,
    #[serde(default = "default_incr_type")]
    pub incr_type: IncrType,
    /// Remote of the manifest-versions repository.
    pub manifest_repo_url: String,
    /// Local clone of the manifest-versions repository.
    pub manifest_dir: PathBuf,
    /// Root of the source checkout.
    pub source_root: PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub dry_run: bool,
    /// Publish even when the checkout was already built.
    #[serde(default)]
    pub force: bool,
    /// Internal builders publish manifests unfiltered.
    #[serde(default)]
    pub internal: bool,
    #[serde(default = "default_whitelisted_remotes")]
    pub whitelisted_remotes: Vec<String>,
    pub status_store: StatusStoreConfig,
    /// Rejected pushes tolerated before a publish gives up.
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_short_timeout_secs")]
    pub short_timeout_secs: u64,
    /// Overrides the build type's long timeout.
    #[serde(default)]
    pub long_timeout_secs: Option<u64>,
    /// Version file, relative to `source_root`.
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,
    /// Committers whose changes are not chumps.
    #[serde(default = "default_trusted_committers")]
    pub trusted_committers: Vec<String>,
    /// Package atom → owning projects.
    #[serde(default)]
    pub package_owners: BTreeMap<String, Vec<String>>,
}

impl CoordinatorConfig {
    pub fn builder(
        build_name: impl Into<String>,
        build_type: BuildType,
        manifest_repo_url: impl Into<String>,
        manifest_dir: impl Into<PathBuf>,
    ) -> CoordinatorConfigBuilder {
        let manifest_dir = manifest_dir.into();
        CoordinatorConfigBuilder {
            config: CoordinatorConfig {
                build_name: build_name.into(),
                build_type,
                incr_type: default_incr_type(),
                manifest_repo_url: manifest_repo_url.into(),
                source_root: PathBuf::from("."),
                status_store: StatusStoreConfig::Fs {
                    root: manifest_dir.join("builder-status"),
                },
                manifest_dir,
                branch: default_branch(),
                dry_run: false,
                force: false,
                internal: false,
                whitelisted_remotes: default_whitelisted_remotes(),
                publish_retries: default_publish_retries(),
                poll_interval_secs: default_poll_interval_secs(),
                short_timeout_secs: default_short_timeout_secs(),
                long_timeout_secs: None,
                version_file: default_version_file(),
                trusted_committers: default_trusted_committers(),
                package_owners: BTreeMap::new(),
            },
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CoordinatorConfig =
            toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.build_name.is_empty() || self.build_name.contains('/') {
            return Err(CoreError::Config(format!(
                "build_name {:?} must be non-empty and contain no '/'",
                self.build_name
            )));
        }
        if self.manifest_repo_url.is_empty() {
            return Err(CoreError::Config("manifest_repo_url is empty".to_string()));
        }
        if self.branch.is_empty() {
            return Err(CoreError::Config("branch is empty".to_string()));
        }
        if self.whitelisted_remotes.is_empty() {
            return Err(CoreError::Config(
                "whitelisted_remotes must name at least one remote".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(CoreError::Config("poll_interval_secs must be > 0".to_string()));
        }
        if self.version_file.is_absolute() {
            return Err(CoreError::Config(
                "version_file must be relative to source_root".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn short_timeout(&self) -> Duration {
        Duration::from_secs(self.short_timeout_secs)
    }

    pub fn long_timeout(&self) -> Duration {
        self.long_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.build_type.default_long_timeout())
    }

    /// Root under which this build type's specs are published.
    pub fn candidate_root(&self) -> PathBuf {
        match self.build_type.candidate_subdir() {
            Some(sub) => self.manifest_dir.join(sub),
            None => self.manifest_dir.clone(),
        }
    }

    pub fn lkgm_path(&self) -> PathBuf {
        self.manifest_dir.join(LKGM_PATH)
    }
}

/// Builder for [`CoordinatorConfig`]; `build` validates.
#[derive(Debug, Clone)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn incr_type(mut self, incr_type: IncrType) -> Self {
        self.config.incr_type = incr_type;
        self
    }

    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.source_root = root.into();
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.config.branch = branch.into();
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.config.force = force;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.config.internal = internal;
        self
    }

    pub fn whitelisted_remotes<I, S>(mut self, remotes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.whitelisted_remotes = remotes.into_iter().map(Into::into).collect();
        self
    }

    pub fn status_store(mut self, store: StatusStoreConfig) -> Self {
        self.config.status_store = store;
        self
    }

    pub fn publish_retries(mut self, retries: u32) -> Self {
        self.config.publish_retries = retries;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_secs = interval.as_secs();
        self
    }

    pub fn short_timeout(mut self, timeout: Duration) -> Self {
        self.config.short_timeout_secs = timeout.as_secs();
        self
    }

    pub fn long_timeout(mut self, timeout: Duration) -> Self {
        self.config.long_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn version_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.version_file = path.into();
        self
    }

    pub fn trusted_committers<I, S>(mut self, committers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.trusted_committers = committers.into_iter().map(Into::into).collect();
        self
    }

    pub fn package_owner<I, S>(mut self, package: &str, projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.package_owners.insert(
            package.to_string(),
            projects.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
