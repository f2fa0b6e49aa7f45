//! Builder status artifacts.
//!
//! Each builder writes exactly one status artifact per candidate version.
//! The coordinator only ever reads them. An absent artifact reads as
//! [`BuildStatus::Missing`]; an artifact that cannot be decoded reads as
//! [`BuildStatus::Failed`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage_traits::{ArtifactKey, ArtifactStore, PutMode, StorageResult};

/// Outcome of one builder for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Inflight,
    Passed,
    Failed,
    /// No artifact exists yet. Distinct from `Failed`.
    Missing,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Inflight => "inflight",
            BuildStatus::Passed => "passed",
            BuildStatus::Failed => "failed",
            BuildStatus::Missing => "missing",
        }
    }

    /// A builder is done once it has passed or failed.
    pub fn is_completed(&self) -> bool {
        matches!(self, BuildStatus::Passed | BuildStatus::Failed)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inflight" => Ok(BuildStatus::Inflight),
            "passed" | "pass" => Ok(BuildStatus::Passed),
            "failed" | "fail" => Ok(BuildStatus::Failed),
            "missing" => Ok(BuildStatus::Missing),
            other => Err(format!("unknown build status: {other}")),
        }
    }
}

/// Flat status record as stored in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderStatus {
    pub status: BuildStatus,
    /// User-facing failure summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Short machine-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl BuilderStatus {
    pub fn new(status: BuildStatus) -> Self {
        Self {
            status,
            message: None,
            reason: None,
            dashboard_url: None,
            recorded_at: None,
        }
    }

    pub fn missing() -> Self {
        Self::new(BuildStatus::Missing)
    }

    pub fn inflight() -> Self {
        Self::new(BuildStatus::Inflight)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_dashboard_url(mut self, url: impl Into<String>) -> Self {
        self.dashboard_url = Some(url.into());
        self
    }

    pub fn recorded_now(mut self) -> Self {
        self.recorded_at = Some(Utc::now());
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    pub fn passed(&self) -> bool {
        self.status == BuildStatus::Passed
    }

    pub fn failed(&self) -> bool {
        self.status == BuildStatus::Failed
    }

    pub fn is_inflight(&self) -> bool {
        self.status == BuildStatus::Inflight
    }

    pub fn is_missing(&self) -> bool {
        self.status == BuildStatus::Missing
    }

    /// Decode a stored artifact. Undecodable bytes are a failed build.
    pub fn decode(data: &[u8]) -> Self {
        match serde_json::from_slice(data) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "undecodable builder status artifact, treating as failed");
                BuilderStatus::new(BuildStatus::Failed)
            }
        }
    }

    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Read the status `builder` recorded for `version`.
pub async fn read_builder_status(
    store: &dyn ArtifactStore,
    builder: &str,
    version: &str,
) -> StorageResult<BuilderStatus> {
    let key = ArtifactKey::builder_status(version, builder)?;
    Ok(match store.get(&key).await? {
        Some(data) => BuilderStatus::decode(&data),
        None => BuilderStatus::missing(),
    })
}

/// Write the status for `builder` at `version`.
pub async fn write_builder_status(
    store: &dyn ArtifactStore,
    builder: &str,
    version: &str,
    status: &BuilderStatus,
    mode: PutMode,
) -> StorageResult<()> {
    let key = ArtifactKey::builder_status(version, builder)?;
    store.put(&key, &status.encode()?, mode).await
}
