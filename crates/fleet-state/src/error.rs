//! Error types for fleet-state

use thiserror::Error;

/// Errors that can occur in the artifact store layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// A create-only write found an artifact already present
    #[error("artifact already exists: {key}")]
    AlreadyExists { key: String },

    /// Artifact key is empty or escapes the store root
    #[error("invalid artifact key: {key}")]
    InvalidKey { key: String },

    /// The object store answered with a non-success status
    #[error("request to {url} failed with HTTP {status}")]
    Http { url: String, status: u16 },

    /// The object store could not be reached
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
