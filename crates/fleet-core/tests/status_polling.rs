//! Status aggregation and candidate hand-off on simulated time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::config::CoordinatorConfigBuilder;
use fleet_core::fakes::{FakeCheckout, ScriptedGit};
use fleet_core::{
    BuildCoordinator, BuildType, Collaborators, CoordinatorConfig, CoreError, Manifest,
    StaticPackageOwners, VersionNumber,
};
use fleet_state::fakes::MemoryArtifactStore;
use fleet_state::{
    write_builder_status, ArtifactKey, ArtifactStore, BuildStatus, BuilderStatus, PutMode,
};
use tokio::time::Instant;

const BUILD: &str = "x86-generic-pfq";

fn coordinator(
    manifest_dir: &Path,
    status: Arc<MemoryArtifactStore>,
    tweak: impl FnOnce(CoordinatorConfigBuilder) -> CoordinatorConfigBuilder,
) -> BuildCoordinator {
    let version = VersionNumber::release(5100, 0, 0).with_chrome_branch(32);
    let checkout = Arc::new(FakeCheckout::new(manifest_dir, version, Manifest::new()));
    coordinator_with_checkout(manifest_dir, status, checkout, tweak)
}

fn coordinator_with_checkout(
    manifest_dir: &Path,
    status: Arc<MemoryArtifactStore>,
    checkout: Arc<FakeCheckout>,
    tweak: impl FnOnce(CoordinatorConfigBuilder) -> CoordinatorConfigBuilder,
) -> BuildCoordinator {
    let builder = CoordinatorConfig::builder(BUILD, BuildType::Pfq, "unused", manifest_dir)
        .poll_interval(Duration::from_secs(30));
    let config = tweak(builder).build().unwrap();
    BuildCoordinator::new(
        config,
        Collaborators {
            checkout,
            git: Arc::new(ScriptedGit::new()),
            status,
            packages: Arc::new(StaticPackageOwners::default()),
        },
    )
}

fn rc(n: u32) -> VersionNumber {
    VersionNumber::candidate(5100, 0, 0, n).with_chrome_branch(32)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn record(store: &MemoryArtifactStore, builder: &str, version: &VersionNumber, status: BuildStatus) {
    write_builder_status(
        store,
        builder,
        &version.to_string(),
        &BuilderStatus::new(status),
        PutMode::Overwrite,
    )
    .await
    .unwrap();
}

fn publish_spec(manifest_dir: &Path, version: &VersionNumber) {
    let dir = manifest_dir.join("LKGM-candidates/buildspecs/32");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{version}.xml")), "<manifest/>").unwrap();
}

#[tokio::test(start_paused = true)]
async fn late_result_is_seen_and_silent_builder_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryArtifactStore::new());
    let coordinator = coordinator(dir.path(), store.clone(), |b| b);

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(75)).await;
            record(&store, "A", &rc(1), BuildStatus::Passed).await;
        })
    };

    let started = Instant::now();
    let statuses = coordinator
        .poll_builders_status(&rc(1), &names(&["A", "B"]), Duration::from_secs(120))
        .await
        .unwrap();
    writer.await.unwrap();

    assert_eq!(statuses["A"].status, BuildStatus::Passed);
    assert_eq!(statuses["B"].status, BuildStatus::Missing);
    assert_eq!(started.elapsed(), Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn completed_builders_return_in_one_round() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryArtifactStore::new());
    record(&store, "A", &rc(1), BuildStatus::Passed).await;
    record(&store, "B", &rc(1), BuildStatus::Failed).await;
    let coordinator = coordinator(dir.path(), store, |b| b);

    let started = Instant::now();
    let statuses = coordinator
        .poll_builders_status(&rc(1), &names(&["A", "B"]), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(statuses["A"].status, BuildStatus::Passed);
    assert_eq!(statuses["B"].status, BuildStatus::Failed);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn completed_status_is_not_reread() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryArtifactStore::new());
    record(&store, "A", &rc(1), BuildStatus::Passed).await;
    let coordinator = coordinator(dir.path(), store.clone(), |b| b);

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            record(&store, "A", &rc(1), BuildStatus::Failed).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            record(&store, "B", &rc(1), BuildStatus::Passed).await;
        })
    };

    let statuses = coordinator
        .poll_builders_status(&rc(1), &names(&["A", "B"]), Duration::from_secs(300))
        .await
        .unwrap();
    writer.await.unwrap();
    assert_eq!(statuses["A"].status, BuildStatus::Passed);
    assert_eq!(statuses["B"].status, BuildStatus::Passed);
}

#[tokio::test(start_paused = true)]
async fn undecodable_artifact_reads_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryArtifactStore::new());
    let key = ArtifactKey::builder_status(&rc(1).to_string(), "A").unwrap();
    store.put(&key, b"\x00garbage", PutMode::Overwrite).await.unwrap();
    let coordinator = coordinator(dir.path(), store, |b| b);

    let statuses = coordinator
        .poll_builders_status(&rc(1), &names(&["A"]), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(statuses["A"].status, BuildStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn latest_candidate_prefers_unbuilt_newest() {
    let dir = tempfile::tempdir().unwrap();
    publish_spec(dir.path(), &rc(1));
    publish_spec(dir.path(), &rc(2));
    let store = Arc::new(MemoryArtifactStore::new());
    record(&store, BUILD, &rc(1), BuildStatus::Passed).await;
    let mut coordinator = coordinator(dir.path(), store, |b| b);

    let path = coordinator.get_latest_candidate().await.unwrap().unwrap();
    assert!(path.ends_with("LKGM-candidates/buildspecs/32/5100.0.0-rc2.xml"));
    assert_eq!(coordinator.current_version(), Some(&rc(2)));
}

#[tokio::test(start_paused = true)]
async fn claimed_candidate_is_not_handed_out_twice() {
    let dir = tempfile::tempdir().unwrap();
    publish_spec(dir.path(), &rc(1));
    let store = Arc::new(MemoryArtifactStore::new());
    let short = |b: CoordinatorConfigBuilder| b.long_timeout(Duration::from_secs(60));
    let checkout = Arc::new(FakeCheckout::new(
        dir.path(),
        VersionNumber::release(5100, 0, 0).with_chrome_branch(32),
        Manifest::new(),
    ));

    let mut first = coordinator(dir.path(), store.clone(), short);
    let mut second = coordinator_with_checkout(dir.path(), store.clone(), checkout.clone(), short);

    assert!(first.get_latest_candidate().await.unwrap().is_some());
    let claimed = store
        .get(&ArtifactKey::builder_status(&rc(1).to_string(), BUILD).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(BuilderStatus::decode(&claimed).status, BuildStatus::Inflight);

    assert!(first.get_latest_candidate().await.unwrap().is_none());
    assert!(second.get_latest_candidate().await.unwrap().is_none());
    assert!(checkout.syncs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn found_candidate_is_synced() {
    let dir = tempfile::tempdir().unwrap();
    publish_spec(dir.path(), &rc(1));
    let store = Arc::new(MemoryArtifactStore::new());
    let checkout = Arc::new(FakeCheckout::new(
        dir.path(),
        VersionNumber::release(5100, 0, 0).with_chrome_branch(32),
        Manifest::new(),
    ));
    let mut coordinator = coordinator_with_checkout(dir.path(), store, checkout.clone(), |b| b);

    let path = coordinator.get_latest_candidate().await.unwrap().unwrap();
    assert_eq!(checkout.syncs(), vec![Some(path)]);
}

#[tokio::test(start_paused = true)]
async fn latest_candidate_waits_out_long_timeout() {
    let dir = tempfile::tempdir().unwrap();
    publish_spec(dir.path(), &rc(1));
    let store = Arc::new(MemoryArtifactStore::new());
    record(&store, BUILD, &rc(1), BuildStatus::Inflight).await;
    let mut coordinator = coordinator(dir.path(), store, |b| b.long_timeout(Duration::from_secs(90)));

    let started = Instant::now();
    assert!(coordinator.get_latest_candidate().await.unwrap().is_none());
    assert_eq!(started.elapsed(), Duration::from_secs(90));
    assert!(coordinator.current_version().is_none());
}

#[tokio::test(start_paused = true)]
async fn dry_run_returns_latest_even_if_built() {
    let dir = tempfile::tempdir().unwrap();
    publish_spec(dir.path(), &rc(1));
    let store = Arc::new(MemoryArtifactStore::new());
    record(&store, BUILD, &rc(1), BuildStatus::Passed).await;
    let mut coordinator = coordinator(dir.path(), store, |b| b.dry_run(true));

    assert!(coordinator.get_latest_candidate().await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn missing_publish_directory_is_structural_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryArtifactStore::new());
    let mut coordinator = coordinator(dir.path(), store, |b| b);

    assert!(matches!(
        coordinator.get_latest_candidate().await,
        Err(CoreError::PublishDirectoryMissing(_))
    ));
}

#[tokio::test]
async fn inflight_marker_is_create_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryArtifactStore::new());
    let mut coordinator = coordinator(dir.path(), store.clone(), |b| b);

    assert!(matches!(
        coordinator.set_inflight("A").await,
        Err(CoreError::NoCurrentCandidate)
    ));

    coordinator.set_current_version(rc(3));
    coordinator.set_inflight("A").await.unwrap();
    assert!(matches!(
        coordinator.set_inflight("A").await,
        Err(CoreError::AlreadyInflight { .. })
    ));

    let failed = BuilderStatus::new(BuildStatus::Failed).with_message("vm tests failed");
    coordinator.record_status("A", &failed).await.unwrap();
    let statuses = coordinator
        .get_builders_status(&names(&["A"]), false)
        .await
        .unwrap();
    assert_eq!(statuses["A"].status, BuildStatus::Failed);
    assert_eq!(statuses["A"].message.as_deref(), Some("vm tests failed"));
    assert!(statuses["A"].recorded_at.is_some());
}
