use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::storage_traits::{ArtifactKey, ArtifactStore, PutMode, StorageResult};

/// Filesystem-backed artifact store, typically on a shared mount.
///
/// Layout: `<root>/<key segments...>`
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a new `FsArtifactStore` rooted at `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, key: &ArtifactKey) -> PathBuf {
        key.segments().fold(self.root.clone(), |p, seg| p.join(seg))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn get(&self, key: &ArtifactKey) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.artifact_path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn put(&self, key: &ArtifactKey, data: &[u8], mode: PutMode) -> StorageResult<()> {
        let path = self.artifact_path(key);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        // Atomic write: write to temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        match mode {
            PutMode::Overwrite => {
                tmp.persist(&path).map_err(|e| e.error)?;
            }
            PutMode::CreateOnly => {
                tmp.persist_noclobber(&path).map_err(|e| {
                    if e.error.kind() == ErrorKind::AlreadyExists {
                        StorageError::AlreadyExists {
                            key: key.as_str().to_string(),
                        }
                    } else {
                        StorageError::Io(e.error)
                    }
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn nested_key_lands_under_root() {
        let (dir, store) = make_store();
        let key = ArtifactKey::builder_status("1.0.0-rc1", "amd64-paladin").unwrap();
        store.put(&key, b"{}", PutMode::Overwrite).await.unwrap();

        let on_disk = dir
            .path()
            .join("builder-status")
            .join("1.0.0-rc1")
            .join("amd64-paladin");
        assert_eq!(fs::read(on_disk).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let (dir, store) = make_store();
        let key = ArtifactKey::new("a/b").unwrap();
        store.put(&key, b"one", PutMode::CreateOnly).await.unwrap();
        let _ = store.put(&key, b"two", PutMode::CreateOnly).await;

        let entries: Vec<_> = fs::read_dir(dir.path().join("a")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
