//! Error taxonomy for fleet-core.

use std::path::PathBuf;

use fleet_state::StorageError;

use crate::failures::StepFailure;
use crate::manifest::ManifestError;
use crate::version::VersionError;

/// Fleet coordination errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("version error: {0}")]
    Version(#[from] VersionError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Failure(#[from] StepFailure),

    #[error("git error: {0}")]
    Git(String),

    #[error("checkout error: {0}")]
    Checkout(String),

    #[error("publish directory missing: {}", .0.display())]
    PublishDirectoryMissing(PathBuf),

    #[error("candidate {0} is already published")]
    CandidateExists(String),

    #[error("no published candidate {0}")]
    CandidateNotFound(String),

    #[error("no current candidate; create or fetch one first")]
    NoCurrentCandidate,

    #[error("failed to publish {what} after {attempts} attempts")]
    PublishExhausted { what: String, attempts: u32 },

    #[error("builder {builder} already inflight for {version}")]
    AlreadyInflight { builder: String, version: String },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fleet-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
