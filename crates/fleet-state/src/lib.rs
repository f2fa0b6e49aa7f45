//! Fleet-State: shared status-artifact store
//!
//! Builders never talk to each other directly. Each one writes a status
//! artifact into a shared store, keyed by candidate version and builder
//! name, and the coordinator polls those artifacts.
//!
//! ## Key Components
//!
//! - `ArtifactStore`: write-once key/value trait
//! - `BuilderStatus`: the flat status record builders publish
//! - `FsArtifactStore` / `HttpArtifactStore`: shared-mount and object-store backends
//! - `fakes::MemoryArtifactStore`: in-memory store for tests

mod error;
pub mod fakes;
mod fs_store;
mod http_store;
pub mod status;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::FsArtifactStore;
pub use http_store::HttpArtifactStore;
pub use status::{read_builder_status, write_builder_status, BuildStatus, BuilderStatus};
pub use storage_traits::{ArtifactKey, ArtifactStore, ContentDigest, PutMode, StorageResult};
