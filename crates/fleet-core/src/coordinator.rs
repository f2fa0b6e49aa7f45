//! Build coordination.
//!
//! A [`BuildCoordinator`] is owned by one builder run. Masters use it to
//! publish a candidate and wait on their slaves; slaves use it to pick up
//! the newest candidate nobody has built yet and to report back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleet_state::{
    read_builder_status, write_builder_status, ArtifactStore, BuilderStatus, PutMode,
    StorageError,
};
use futures::future::join_all;
use tracing::{info, warn};

use crate::blame::{BlameEngine, PackageMetadata};
use crate::blamelist::{generate_blamelist, BlameEntry};
use crate::candidate_store::{Candidate, CandidateStore};
use crate::checkout::SourceCheckout;
use crate::config::{BuildType, CoordinatorConfig};
use crate::error::{CoreError, Result};
use crate::failures::{wrap_failure, CompoundKind, StepFailure};
use crate::git::GitOps;
use crate::manifest::{Manifest, PendingPatch};
use crate::obs;
use crate::poll::PollTimer;
use crate::version::{IncrType, VersionNumber};

/// External systems a coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub checkout: Arc<dyn SourceCheckout>,
    pub git: Arc<dyn GitOps>,
    pub status: Arc<dyn ArtifactStore>,
    pub packages: Arc<dyn PackageMetadata>,
}

/// Slave results, bucketed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveVerdict {
    pub passed: BTreeSet<String>,
    pub failing: BTreeSet<String>,
    pub inflight: BTreeSet<String>,
    pub missing: BTreeSet<String>,
}

impl SlaveVerdict {
    pub fn from_statuses(statuses: &BTreeMap<String, BuilderStatus>) -> Self {
        let mut verdict = SlaveVerdict::default();
        for (name, status) in statuses {
            let bucket = if status.passed() {
                &mut verdict.passed
            } else if status.failed() {
                &mut verdict.failing
            } else if status.is_inflight() {
                &mut verdict.inflight
            } else {
                &mut verdict.missing
            };
            bucket.insert(name.clone());
        }
        verdict
    }

    pub fn all_passed(&self) -> bool {
        self.failing.is_empty() && self.inflight.is_empty() && self.missing.is_empty()
    }

    /// Builders that did not pass.
    pub fn problems(&self) -> BTreeSet<String> {
        self.failing
            .iter()
            .chain(&self.inflight)
            .chain(&self.missing)
            .cloned()
            .collect()
    }

    /// Fatal unless every builder that did not pass is a sanity-check slave.
    pub fn is_fatal(&self, sanity_check_slaves: &[String]) -> bool {
        self.problems()
            .iter()
            .any(|name| !sanity_check_slaves.contains(name))
    }
}

pub struct BuildCoordinator {
    config: Arc<CoordinatorConfig>,
    store: CandidateStore,
    checkout: Arc<dyn SourceCheckout>,
    git: Arc<dyn GitOps>,
    status: Arc<dyn ArtifactStore>,
    blame: BlameEngine,
    current: Option<VersionNumber>,
}

impl BuildCoordinator {
    pub fn new(config: CoordinatorConfig, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let Collaborators {
            checkout,
            git,
            status,
            packages,
        } = collaborators;
        Self {
            store: CandidateStore::new(config.clone(), checkout.clone(), git.clone()),
            config,
            checkout,
            git,
            status,
            blame: BlameEngine::new(packages),
            current: None,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &CandidateStore {
        &self.store
    }

    /// The candidate this run is building, once created or picked up.
    pub fn current_version(&self) -> Option<&VersionNumber> {
        self.current.as_ref()
    }

    /// Adopt `version` as the current candidate, e.g. one named on the command line.
    pub fn set_current_version(&mut self, version: VersionNumber) {
        self.current = Some(version);
    }

    fn require_current(&self) -> Result<&VersionNumber> {
        self.current.as_ref().ok_or(CoreError::NoCurrentCandidate)
    }

    /// Publish the next candidate and make it current.
    ///
    /// For PFQ builds the blamelist since the LKGM is logged first.
    pub async fn create_new_candidate(
        &mut self,
        patches: &[PendingPatch],
        tool_version: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        if self.should_generate_blamelist() {
            if self.config.lkgm_path().is_file() {
                self.generate_blamelist_since_lkgm().await?;
            } else {
                info!("no LKGM yet, skipping blamelist");
            }
        }

        let candidate = self.store.create_new_candidate(patches, tool_version).await?;
        Ok(candidate.map(|c| self.adopt(c)))
    }

    /// Publish an existing manifest, make it current and claim it for this
    /// builder.
    pub async fn create_from_manifest(&mut self, source: &Path) -> Result<PathBuf> {
        let candidate = self.store.create_from_manifest(source).await?;
        let path = self.adopt(candidate);
        self.set_inflight(&self.config.build_name).await?;
        Ok(path)
    }

    fn adopt(&mut self, candidate: Candidate) -> PathBuf {
        self.current = Some(candidate.version);
        candidate.path
    }

    /// Wait up to the long timeout for a candidate this builder has not built,
    /// claim it, and sync the checkout to it.
    ///
    /// A candidate another instance of this builder claims first is treated
    /// as built. Dry runs take the newest candidate without claiming it.
    /// Returns `None` when nothing new was published in time.
    pub async fn get_latest_candidate(&mut self) -> Result<Option<PathBuf>> {
        let Some(path) = self.wait_for_unbuilt_candidate().await? else {
            return Ok(None);
        };

        self.checkout.sync(Some(&path)).await?;
        if self.should_generate_blamelist() && self.config.lkgm_path().is_file() {
            self.generate_blamelist_since_lkgm().await?;
        }
        Ok(Some(path))
    }

    async fn wait_for_unbuilt_candidate(&mut self) -> Result<Option<PathBuf>> {
        let chrome_branch = self
            .checkout
            .current_version()
            .await?
            .require_chrome_branch()?;
        let timer = PollTimer::start(self.config.long_timeout(), self.config.poll_interval());

        loop {
            self.store.refresh().await?;
            self.store.require_publish_root()?;

            if let Some(latest) = self.store.latest_candidate(chrome_branch)? {
                if self.config.dry_run {
                    info!(version = %latest, "dry run, taking newest candidate");
                    let path = self.store.spec_path(&latest)?;
                    self.current = Some(latest);
                    return Ok(Some(path));
                }
                let status = self
                    .read_status(&self.config.build_name, &latest.to_string())
                    .await?;
                if status.is_missing() {
                    let path = self.store.spec_path(&latest)?;
                    let previous = self.current.replace(latest.clone());
                    match self.set_inflight(&self.config.build_name).await {
                        Ok(()) => {
                            info!(version = %latest, "starting candidate");
                            return Ok(Some(path));
                        }
                        Err(CoreError::AlreadyInflight { .. }) => {
                            info!(version = %latest, "candidate claimed by another run");
                            self.current = previous;
                        }
                        Err(e) => {
                            self.current = previous;
                            return Err(e);
                        }
                    }
                }
            }

            info!(minutes_left = timer.minutes_left(), "found nothing new to build, waiting");
            if !timer.tick().await {
                info!("timed out waiting for a new candidate");
                return Ok(None);
            }
        }
    }

    async fn read_status(&self, builder: &str, version: &str) -> Result<BuilderStatus> {
        let status = read_builder_status(&*self.status, builder, version).await;
        Ok(wrap_failure(CompoundKind::GsDownload, status)?)
    }

    /// Poll the statuses of `builders` for `version` until all have completed
    /// or `timeout` elapses.
    ///
    /// Completed statuses are not re-read. Builders still without a result
    /// at the deadline are reported as they were last seen, which is
    /// `MISSING` if they never wrote anything.
    pub async fn poll_builders_status(
        &self,
        version: &VersionNumber,
        builders: &[String],
        timeout: Duration,
    ) -> Result<BTreeMap<String, BuilderStatus>> {
        let version = version.to_string();
        let mut statuses: BTreeMap<String, BuilderStatus> = builders
            .iter()
            .map(|b| (b.clone(), BuilderStatus::missing()))
            .collect();
        let timer = PollTimer::start(timeout, self.config.poll_interval());

        loop {
            let pending: Vec<String> = statuses
                .iter()
                .filter(|(_, s)| !s.is_completed())
                .map(|(name, _)| name.clone())
                .collect();

            let reads = join_all(pending.iter().map(|name| self.read_status(name, &version))).await;
            for (name, status) in pending.iter().zip(reads) {
                let status = status?;
                obs::emit_builder_status(name, &version, status.status.as_str());
                statuses.insert(name.clone(), status);
            }

            let waiting: Vec<String> = statuses
                .iter()
                .filter(|(_, s)| !s.is_completed())
                .map(|(name, _)| name.clone())
                .collect();
            if waiting.is_empty() {
                return Ok(statuses);
            }
            for name in &waiting {
                if statuses[name].is_missing() {
                    warn!(builder = %name, version = %version, "no status yet");
                }
            }

            info!(
                minutes_left = timer.minutes_left(),
                waiting_on = %waiting.join(","),
                "waiting for builders",
            );
            if !timer.tick().await {
                obs::emit_status_timeout(&version, &waiting);
                return Ok(statuses);
            }
        }
    }

    /// Statuses of `builders` for the current candidate.
    ///
    /// Waits the long timeout when `wait_for_results`, else the short one.
    pub async fn get_builders_status(
        &self,
        builders: &[String],
        wait_for_results: bool,
    ) -> Result<BTreeMap<String, BuilderStatus>> {
        let version = self.require_current()?;
        let timeout = if wait_for_results {
            self.config.long_timeout()
        } else {
            self.config.short_timeout()
        };
        self.poll_builders_status(version, builders, timeout).await
    }

    /// Quorum verdict over slave statuses.
    pub fn evaluate_slave_statuses(
        statuses: &BTreeMap<String, BuilderStatus>,
        sanity_check_slaves: &[String],
    ) -> (SlaveVerdict, bool) {
        let verdict = SlaveVerdict::from_statuses(statuses);
        let fatal = verdict.is_fatal(sanity_check_slaves);
        (verdict, fatal)
    }

    /// Write `builder`'s status for the current candidate.
    pub async fn record_status(&self, builder: &str, status: &BuilderStatus) -> Result<()> {
        let version = self.require_current()?.to_string();
        let write = write_builder_status(
            &*self.status,
            builder,
            &version,
            &status.clone().recorded_now(),
            PutMode::Overwrite,
        )
        .await;
        wrap_failure(CompoundKind::GsUpload, write)?;
        obs::emit_builder_status(builder, &version, status.status.as_str());
        Ok(())
    }

    /// Claim the current candidate for `builder`.
    ///
    /// Fails with [`CoreError::AlreadyInflight`] if any status already exists.
    pub async fn set_inflight(&self, builder: &str) -> Result<()> {
        let version = self.require_current()?.to_string();
        let write = write_builder_status(
            &*self.status,
            builder,
            &version,
            &BuilderStatus::inflight().recorded_now(),
            PutMode::CreateOnly,
        )
        .await;
        match write {
            Err(StorageError::AlreadyExists { .. }) => {
                return Err(CoreError::AlreadyInflight {
                    builder: builder.to_string(),
                    version,
                })
            }
            other => wrap_failure(CompoundKind::GsUpload, other)?,
        }
        obs::emit_builder_status(builder, &version, "inflight");
        Ok(())
    }

    /// Only incremental PFQ-family builds other than Chrome PFQ report blame.
    pub fn should_generate_blamelist(&self) -> bool {
        self.config.incr_type == IncrType::Build
            && self.config.build_type.is_pfq_type()
            && self.config.build_type != BuildType::ChromePfq
    }

    /// Changes in the checkout since the LKGM. Commit queue builds list only chumps.
    pub async fn generate_blamelist_since_lkgm(&self) -> Result<Vec<BlameEntry>> {
        let lkgm = Manifest::load(&self.config.lkgm_path())?;
        let only_chumps = self.config.build_type == BuildType::CommitQueue;
        generate_blamelist(
            &lkgm,
            &*self.checkout,
            &*self.git,
            &self.config.trusted_committers,
            only_chumps,
        )
        .await
    }

    pub async fn find_suspects(
        &self,
        failures: &[StepFailure],
        changes: &[PendingPatch],
    ) -> Result<Vec<PendingPatch>> {
        self.blame.find_suspects(failures, changes).await
    }

    /// Make the current candidate the LKGM.
    pub async fn promote_candidate(&self) -> Result<PathBuf> {
        let version = self.require_current()?;
        self.store.promote_candidate(version).await
    }
}
