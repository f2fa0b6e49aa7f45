//! HTTP object-store backend.
//!
//! Speaks plain `GET`/`PUT` against `<base_url>/<key>`. Create-only writes
//! send `x-goog-if-generation-match: 0`, so a GCS-compatible server rejects
//! the second writer with `412 Precondition Failed`.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{ArtifactKey, ArtifactStore, PutMode, StorageResult};

const CREATE_ONLY_HEADER: &str = "x-goog-if-generation-match";

/// Artifact store reached over HTTP.
pub struct HttpArtifactStore {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpArtifactStore {
    /// Create a client for the bucket at `base_url`.
    pub fn new(base_url: &str) -> StorageResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("fleet-state/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HttpArtifactStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn object_url(&self, key: &ArtifactKey) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn get(&self, key: &ArtifactKey) -> StorageResult<Option<Vec<u8>>> {
        let url = self.object_url(key);
        let response = self.http_client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(url = %url, "artifact not found");
                Ok(None)
            }
            s if s.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            s => Err(StorageError::Http {
                url,
                status: s.as_u16(),
            }),
        }
    }

    async fn put(&self, key: &ArtifactKey, data: &[u8], mode: PutMode) -> StorageResult<()> {
        let url = self.object_url(key);
        let mut request = self.http_client.put(&url).body(data.to_vec());
        if mode == PutMode::CreateOnly {
            request = request.header(CREATE_ONLY_HEADER, "0");
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED => Err(StorageError::AlreadyExists {
                key: key.as_str().to_string(),
            }),
            s if s.is_success() => Ok(()),
            s => Err(StorageError::Http {
                url,
                status: s.as_u16(),
            }),
        }
    }
}
