//! Fleet Core Library
//!
//! Coordinates a fleet of CI builders around shared candidate manifests.
//!
//! ## Key Components
//!
//! - `VersionNumber`: candidate versions and their ordering
//! - `Manifest`: the pinned-revision manifest model and its transforms
//! - `CandidateStore`: race-safe publication through a manifest repository
//! - `BuildCoordinator`: candidate hand-off and slave status aggregation
//! - `StepFailure` / `BlameEngine`: failure taxonomy and suspect selection

pub mod blame;
pub mod blamelist;
pub mod candidate_store;
pub mod checkout;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod failures;
pub mod fakes;
pub mod git;
pub mod manifest;
pub mod obs;
pub mod poll;
pub mod registry;
pub mod telemetry;
pub mod version;

pub use blame::{BlameEngine, PackageMetadata, StaticPackageOwners};
pub use blamelist::BlameEntry;
pub use candidate_store::{next_candidate_version, Candidate, CandidateStore};
pub use checkout::{RepoCheckout, SourceCheckout};
pub use config::{BuildType, CoordinatorConfig, StatusStoreConfig};
pub use coordinator::{BuildCoordinator, Collaborators, SlaveVerdict};
pub use error::{CoreError, Result};
pub use failures::{
    wrap_failure, with_failure_type, BuildFailureMessage, CompoundKind, FailureKind,
    FailureRecord, StepFailure,
};
pub use git::{capture_head_sha, GitCli, GitOps, PushOutcome, PUSH_BRANCH};
pub use manifest::{Manifest, ManifestError, PendingPatch, Project};
pub use poll::PollTimer;
pub use registry::{BuilderConfig, BuilderRegistry, ConfigOverrides, Overlays};
pub use telemetry::init_tracing;
pub use version::{IncrType, VersionError, VersionNumber};
