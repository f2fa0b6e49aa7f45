//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryArtifactStore`, which satisfies the `ArtifactStore`
//! contract without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory artifact store backed by a `HashMap<key, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of artifacts currently held.
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, key: &ArtifactKey) -> StorageResult<Option<Vec<u8>>> {
        let store = self.store.lock().unwrap();
        Ok(store.get(key.as_str()).cloned())
    }

    async fn put(&self, key: &ArtifactKey, data: &[u8], mode: PutMode) -> StorageResult<()> {
        let mut store = self.store.lock().unwrap();
        if mode == PutMode::CreateOnly && store.contains_key(key.as_str()) {
            return Err(StorageError::AlreadyExists {
                key: key.as_str().to_string(),
            });
        }
        store.insert(key.as_str().to_string(), data.to_vec());
        Ok(())
    }
}
