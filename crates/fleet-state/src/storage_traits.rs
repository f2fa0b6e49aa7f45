//! Storage trait definitions for fleet
//!
//! - `ArtifactStore`: write-once key/value surface shared by every builder
//! - `ArtifactKey`: validated, `/`-separated object key
//! - `ContentDigest`: SHA-256 identity of an artifact or manifest
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// SHA-256 of a byte string, lowercase hex.
///
/// Promotion compares the digest of the LKGM on disk with that of the
/// candidate to decide whether there is anything to push.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn from_bytes(data: &[u8]) -> Self {
        ContentDigest(hex::encode(Sha256::digest(data)))
    }

    /// Digest of a file's contents, or `None` if it does not exist.
    pub fn of_file(path: &Path) -> StorageResult<Option<Self>> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(Self::from_bytes(&data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ArtifactKey
// ---------------------------------------------------------------------------

/// Object key inside an [`ArtifactStore`].
///
/// Always relative, `/`-separated, with no empty, `.` or `..` segments, so
/// every backend can map it onto a path or URL without escaping its root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Validate and wrap a raw key.
    pub fn new(key: impl Into<String>) -> StorageResult<Self> {
        let key = key.into();
        let valid = !key.is_empty()
            && key
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
        if !valid {
            return Err(StorageError::InvalidKey { key });
        }
        Ok(ArtifactKey(key))
    }

    /// Key of the status artifact a builder writes for one candidate:
    /// `builder-status/<version>/<builder>`.
    pub fn builder_status(version: &str, builder: &str) -> StorageResult<Self> {
        if version.contains('/') || builder.contains('/') {
            return Err(StorageError::InvalidKey {
                key: format!("builder-status/{version}/{builder}"),
            });
        }
        Self::new(format!("builder-status/{version}/{builder}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        ArtifactKey::new(s)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// Write semantics for [`ArtifactStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fail with `StorageError::AlreadyExists` if the key is present.
    CreateOnly,
    /// Replace any existing value.
    Overwrite,
}

/// Shared key/value surface builders publish their results to.
///
/// Guarantees:
/// - `get` returns `None` for a key that was never written (never an error).
/// - `put(.., CreateOnly)` is atomic: of two racing writers exactly one wins.
/// - A reader never observes a partially written value.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read an artifact. `Ok(None)` when absent.
    async fn get(&self, key: &ArtifactKey) -> StorageResult<Option<Vec<u8>>>;

    /// Write an artifact.
    async fn put(&self, key: &ArtifactKey, data: &[u8], mode: PutMode) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex() {
        let d = ContentDigest::from_bytes(b"manifest");
        assert_eq!(d.as_str().len(), 64);
        assert!(d.as_str().bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        assert_eq!(d, ContentDigest::from_bytes(b"manifest"));
        assert_ne!(d, ContentDigest::from_bytes(b"manifest\n"));
        assert_eq!(d.short(), &d.as_str()[..12]);
    }

    #[test]
    fn file_digest_matches_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lkgm.xml");
        assert_eq!(ContentDigest::of_file(&path).unwrap(), None);

        std::fs::write(&path, b"<manifest/>").unwrap();
        assert_eq!(
            ContentDigest::of_file(&path).unwrap(),
            Some(ContentDigest::from_bytes(b"<manifest/>"))
        );
    }

    #[test]
    fn key_rejects_escaping_segments() {
        assert!(ArtifactKey::new("").is_err());
        assert!(ArtifactKey::new("a//b").is_err());
        assert!(ArtifactKey::new("/abs").is_err());
        assert!(ArtifactKey::new("a/../b").is_err());
        assert!(ArtifactKey::new("a/./b").is_err());
        assert!(ArtifactKey::new("a/b").is_ok());
    }

    #[test]
    fn builder_status_key_layout() {
        let key = ArtifactKey::builder_status("1.2.3-rc4", "x86-generic-paladin").unwrap();
        assert_eq!(key.as_str(), "builder-status/1.2.3-rc4/x86-generic-paladin");
        assert_eq!(key.segments().count(), 3);
    }

    #[test]
    fn builder_status_key_rejects_slash_in_name() {
        assert!(ArtifactKey::builder_status("1.2.3-rc1", "a/b").is_err());
    }
}
