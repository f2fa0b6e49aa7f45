//! Suspect selection for failed builds.
//!
//! A failed package implicates the changes to the projects that build it.
//! When a failure cannot be pinned on any change, every change is suspect.
//! Overlay changes can break any package, so they are always suspect once
//! anything has been narrowed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::failures::StepFailure;
use crate::manifest::PendingPatch;
use crate::obs;

/// Marker in a project name for board overlays.
pub const OVERLAY_MARKER: &str = "/overlays/";

/// Maps a package to the source projects it is built from.
#[async_trait]
pub trait PackageMetadata: Send + Sync {
    async fn owning_projects(&self, package: &str) -> Result<BTreeSet<String>>;
}

/// [`PackageMetadata`] from a fixed table. Unknown packages own nothing.
#[derive(Debug, Clone, Default)]
pub struct StaticPackageOwners {
    owners: BTreeMap<String, BTreeSet<String>>,
}

impl StaticPackageOwners {
    pub fn new(owners: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            owners: owners
                .iter()
                .map(|(pkg, projects)| (pkg.clone(), projects.iter().cloned().collect()))
                .collect(),
        }
    }
}

#[async_trait]
impl PackageMetadata for StaticPackageOwners {
    async fn owning_projects(&self, package: &str) -> Result<BTreeSet<String>> {
        Ok(self.owners.get(package).cloned().unwrap_or_default())
    }
}

/// Picks which changes to blame for a failure.
#[derive(Clone)]
pub struct BlameEngine {
    packages: Arc<dyn PackageMetadata>,
}

impl BlameEngine {
    pub fn new(packages: Arc<dyn PackageMetadata>) -> Self {
        Self { packages }
    }

    /// Changes from `changes` suspected of causing `failures`, in input order.
    ///
    /// Only package build failures narrow the set. Any other failure, or a
    /// failed package no change touches, blames every change. Otherwise the
    /// changes to the failed packages' projects are suspect, plus every
    /// overlay change.
    pub async fn find_suspects(
        &self,
        failures: &[StepFailure],
        changes: &[PendingPatch],
    ) -> Result<Vec<PendingPatch>> {
        let mut suspect = vec![false; changes.len()];
        let mut blame_everything = false;

        for failure in failures {
            let Some(packages) = failure.failed_packages() else {
                debug!(kind = %failure.kind(), "unexplained failure");
                blame_everything = true;
                continue;
            };
            for package in packages {
                let projects = self.packages.owning_projects(package).await?;
                let mut found = false;
                for (i, change) in changes.iter().enumerate() {
                    if projects.contains(&change.project) {
                        suspect[i] = true;
                        found = true;
                    }
                }
                if !found {
                    debug!(package = %package, "no change touches failed package");
                    blame_everything = true;
                }
            }
        }

        if blame_everything || !suspect.iter().any(|s| *s) {
            obs::emit_suspects_found(changes.len(), changes.len(), true);
            return Ok(changes.to_vec());
        }

        let suspects: Vec<PendingPatch> = changes
            .iter()
            .zip(&suspect)
            .filter(|(change, s)| **s || change.project.contains(OVERLAY_MARKER))
            .map(|(change, _)| change.clone())
            .collect();
        obs::emit_suspects_found(changes.len(), suspects.len(), false);
        Ok(suspects)
    }
}
