//! Fleet - build fleet coordinator CLI
//!
//! The `fleet` command exposes the coordinator operations a builder runs.
//!
//! ## Commands
//!
//! - `create-candidate`: publish the checkout as the next candidate
//! - `latest-candidate`: wait for a candidate this builder has not built
//! - `builder-status`: poll the statuses of a set of builders
//! - `suspects`: pick the changes to blame for a failure report
//!
//! Commands that produce nothing (no new candidate, nothing to build) exit
//! with status 3 and print nothing.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_core::config::EXTERNAL_REMOTES;
use fleet_core::{
    BuildCoordinator, BuildFailureMessage, BuilderRegistry, Collaborators, CoordinatorConfig,
    GitCli, Manifest, PendingPatch, RepoCheckout, SourceCheckout, StaticPackageOwners,
    StatusStoreConfig, VersionNumber,
};
use fleet_state::{ArtifactStore, BuildStatus, BuilderStatus, FsArtifactStore, HttpArtifactStore};
use tracing::{info, Level};

/// Exit status for operations that legitimately produce no value.
const EXIT_NOTHING: u8 = 3;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build fleet coordinator", long_about = None)]
struct Cli {
    /// Coordinator config (TOML)
    #[arg(long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Builder registry (TOML)
    #[arg(long, global = true, env = "FLEET_REGISTRY")]
    registry: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish the checkout as the next candidate
    CreateCandidate {
        /// Pending patches to inject (JSON array)
        #[arg(long)]
        patches: Option<PathBuf>,

        /// Tool version to stamp into the manifest
        #[arg(long)]
        chrome_version: Option<String>,
    },

    /// Publish an existing manifest under the version in its file name
    CreateFromManifest {
        manifest: PathBuf,
    },

    /// Claim the newest unbuilt candidate and sync the checkout to it
    LatestCandidate,

    /// Poll builder statuses for a candidate
    BuilderStatus {
        /// Candidate version
        #[arg(long = "candidate")]
        version: VersionNumber,

        /// Builders to poll
        #[arg(required = true)]
        builders: Vec<String>,

        /// Use the short timeout instead of waiting for results
        #[arg(long)]
        no_wait: bool,
    },

    /// List changes landed since the LKGM
    Blamelist,

    /// Record a builder's status for a candidate
    RecordStatus {
        #[arg(long = "candidate")]
        version: VersionNumber,

        #[arg(long)]
        builder: String,

        /// passed, failed, inflight or missing
        #[arg(long, required_unless_present = "failure")]
        status: Option<BuildStatus>,

        #[arg(long)]
        message: Option<String>,

        #[arg(long)]
        dashboard_url: Option<String>,

        /// Failure report (JSON); implies a failed status
        #[arg(long, conflicts_with = "status")]
        failure: Option<PathBuf>,
    },

    /// Claim a candidate for a builder
    SetInflight {
        #[arg(long = "candidate")]
        version: VersionNumber,

        #[arg(long)]
        builder: String,
    },

    /// Promote a published candidate to LKGM
    Promote {
        version: VersionNumber,
    },

    /// Pick the changes to blame for a failure report
    Suspects {
        /// Failure report (JSON)
        #[arg(long)]
        failures: PathBuf,

        /// Manifest carrying the changes under test
        #[arg(long)]
        manifest: PathBuf,
    },

    /// List the slaves a master waits for
    Slaves {
        master: String,
    },

    /// Remove internal-only projects from a manifest
    FilterManifest {
        input: PathBuf,
        output: PathBuf,

        /// Whitelisted remote (repeatable); defaults to the config's list
        #[arg(long = "remote")]
        remotes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fleet_core::init_tracing(cli.json, level);

    let config = cli.config.as_deref();
    match cli.command {
        Commands::CreateCandidate {
            patches,
            chrome_version,
        } => {
            cmd_create_candidate(load_config(config)?, patches.as_deref(), chrome_version.as_deref()).await
        }
        Commands::CreateFromManifest { manifest } => {
            cmd_create_from_manifest(load_config(config)?, &manifest).await
        }
        Commands::LatestCandidate => cmd_latest_candidate(load_config(config)?).await,
        Commands::BuilderStatus {
            version,
            builders,
            no_wait,
        } => cmd_builder_status(load_config(config)?, version, &builders, !no_wait).await,
        Commands::Blamelist => cmd_blamelist(load_config(config)?).await,
        Commands::RecordStatus {
            version,
            builder,
            status,
            message,
            dashboard_url,
            failure,
        } => {
            let status = match (failure, status) {
                (Some(path), _) => read_failure_report(&path)?.to_builder_status(),
                (None, status) => {
                    let mut record = BuilderStatus::new(status.unwrap_or(BuildStatus::Missing));
                    if let Some(message) = message {
                        record = record.with_message(message);
                    }
                    record
                }
            };
            let status = match dashboard_url {
                Some(url) => status.with_dashboard_url(url),
                None => status,
            };
            cmd_record_status(load_config(config)?, version, &builder, &status).await
        }
        Commands::SetInflight { version, builder } => {
            cmd_set_inflight(load_config(config)?, version, &builder).await
        }
        Commands::Promote { version } => cmd_promote(load_config(config)?, version).await,
        Commands::Suspects { failures, manifest } => {
            cmd_suspects(load_config(config)?, &failures, &manifest).await
        }
        Commands::Slaves { master } => {
            let path = cli
                .registry
                .as_deref()
                .context("--registry is required for slaves")?;
            cmd_slaves(path, &master)
        }
        Commands::FilterManifest {
            input,
            output,
            remotes,
        } => {
            let remotes = if !remotes.is_empty() {
                remotes
            } else if let Some(path) = config {
                CoordinatorConfig::load(path)?.whitelisted_remotes
            } else {
                EXTERNAL_REMOTES.iter().map(|r| r.to_string()).collect()
            };
            cmd_filter_manifest(&input, &output, &remotes)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<CoordinatorConfig> {
    let path = path.context("--config (or FLEET_CONFIG) is required")?;
    CoordinatorConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn status_store(config: &StatusStoreConfig) -> Result<Arc<dyn ArtifactStore>> {
    let store: Arc<dyn ArtifactStore> = match config {
        StatusStoreConfig::Fs { root } => Arc::new(
            FsArtifactStore::new(root).context("Failed to open status store")?,
        ),
        StatusStoreConfig::Http { base_url } => Arc::new(
            HttpArtifactStore::new(base_url).context("Failed to build status store client")?,
        ),
    };
    Ok(store)
}

fn build_coordinator(config: CoordinatorConfig) -> Result<BuildCoordinator> {
    let collaborators = Collaborators {
        checkout: Arc::new(RepoCheckout::new(
            config.source_root.clone(),
            config.version_file.clone(),
        )),
        git: Arc::new(GitCli::default()),
        status: status_store(&config.status_store)?,
        packages: Arc::new(StaticPackageOwners::new(&config.package_owners)),
    };
    Ok(BuildCoordinator::new(config, collaborators))
}

/// Versions given on the command line carry no chrome branch; take the
/// checkout's.
async fn resolve_version(config: &CoordinatorConfig, version: VersionNumber) -> Result<VersionNumber> {
    if version.chrome_branch().is_some() {
        return Ok(version);
    }
    let checkout = RepoCheckout::new(config.source_root.clone(), config.version_file.clone());
    let branch = checkout
        .current_version()
        .await
        .context("Failed to read checkout version")?
        .require_chrome_branch()?;
    Ok(version.with_chrome_branch(branch))
}

fn read_failure_report(path: &Path) -> Result<BuildFailureMessage> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read failure report {}", path.display()))?;
    serde_json::from_str(&text).context("Invalid failure report")
}

/// Print `value` and succeed, or print nothing and exit with [`EXIT_NOTHING`].
fn emit_path(value: Option<PathBuf>) -> ExitCode {
    match value {
        Some(path) => {
            println!("{}", path.display());
            ExitCode::SUCCESS
        }
        None => ExitCode::from(EXIT_NOTHING),
    }
}

async fn cmd_create_candidate(
    config: CoordinatorConfig,
    patches: Option<&Path>,
    chrome_version: Option<&str>,
) -> Result<ExitCode> {
    let patches: Vec<PendingPatch> = match patches {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read patches {}", path.display()))?;
            serde_json::from_str(&text).context("Invalid patches file")?
        }
        None => Vec::new(),
    };

    let mut coordinator = build_coordinator(config)?;
    let path = coordinator
        .create_new_candidate(&patches, chrome_version)
        .await
        .context("Failed to create candidate")?;
    Ok(emit_path(path))
}

async fn cmd_create_from_manifest(config: CoordinatorConfig, manifest: &Path) -> Result<ExitCode> {
    let mut coordinator = build_coordinator(config)?;
    let path = coordinator
        .create_from_manifest(manifest)
        .await
        .with_context(|| format!("Failed to publish {}", manifest.display()))?;
    Ok(emit_path(Some(path)))
}

async fn cmd_latest_candidate(config: CoordinatorConfig) -> Result<ExitCode> {
    let mut coordinator = build_coordinator(config)?;
    let path = coordinator
        .get_latest_candidate()
        .await
        .context("Failed to pick up a candidate")?;
    Ok(emit_path(path))
}

async fn cmd_builder_status(
    config: CoordinatorConfig,
    version: VersionNumber,
    builders: &[String],
    wait_for_results: bool,
) -> Result<ExitCode> {
    let mut coordinator = build_coordinator(config)?;
    coordinator.set_current_version(version);
    let statuses = coordinator
        .get_builders_status(builders, wait_for_results)
        .await?;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_blamelist(config: CoordinatorConfig) -> Result<ExitCode> {
    let coordinator = build_coordinator(config)?;
    for entry in coordinator.generate_blamelist_since_lkgm().await? {
        println!("{entry}\t{}", entry.url);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_record_status(
    config: CoordinatorConfig,
    version: VersionNumber,
    builder: &str,
    status: &BuilderStatus,
) -> Result<ExitCode> {
    let mut coordinator = build_coordinator(config)?;
    coordinator.set_current_version(version);
    coordinator.record_status(builder, status).await?;
    info!(builder, status = %status.status, "status recorded");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_set_inflight(
    config: CoordinatorConfig,
    version: VersionNumber,
    builder: &str,
) -> Result<ExitCode> {
    let mut coordinator = build_coordinator(config)?;
    coordinator.set_current_version(version);
    coordinator.set_inflight(builder).await?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_promote(config: CoordinatorConfig, version: VersionNumber) -> Result<ExitCode> {
    let version = resolve_version(&config, version).await?;
    let mut coordinator = build_coordinator(config)?;
    coordinator.set_current_version(version);
    let lkgm = coordinator.promote_candidate().await?;
    Ok(emit_path(Some(lkgm)))
}

async fn cmd_suspects(config: CoordinatorConfig, failures: &Path, manifest: &Path) -> Result<ExitCode> {
    let report = read_failure_report(failures)?;
    let changes = Manifest::load(manifest)
        .with_context(|| format!("Failed to load manifest {}", manifest.display()))?
        .pending_patches()?;

    let coordinator = build_coordinator(config)?;
    let suspects = coordinator.find_suspects(&report.tracebacks, &changes).await?;
    println!("{}", serde_json::to_string_pretty(&suspects)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_slaves(registry: &Path, master: &str) -> Result<ExitCode> {
    let registry = BuilderRegistry::load(registry)
        .with_context(|| format!("Failed to load registry {}", registry.display()))?;
    for slave in registry.slaves_for_master(master)? {
        println!("{}", slave.name);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_filter_manifest(input: &Path, output: &Path, remotes: &[String]) -> Result<ExitCode> {
    let manifest = Manifest::load(input)
        .with_context(|| format!("Failed to load manifest {}", input.display()))?;
    let filtered = manifest.filter_internal_projects(remotes)?;
    std::fs::write(output, filtered.to_xml()?)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        kept = filtered.projects()?.len(),
        dropped = manifest.projects()?.len() - filtered.projects()?.len(),
        "filtered manifest"
    );
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_builder_status() {
        let cli = Cli::try_parse_from([
            "fleet",
            "--config",
            "fleet.toml",
            "builder-status",
            "--candidate",
            "5100.0.0-rc2",
            "x86-generic-paladin",
            "wolf-paladin",
            "--no-wait",
        ])
        .unwrap();
        match cli.command {
            Commands::BuilderStatus {
                version,
                builders,
                no_wait,
            } => {
                assert_eq!(version.to_string(), "5100.0.0-rc2");
                assert_eq!(builders, vec!["x86-generic-paladin", "wolf-paladin"]);
                assert!(no_wait);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn rejects_malformed_version() {
        assert!(Cli::try_parse_from(["fleet", "promote", "5100.0.0-rc01"]).is_err());
    }

    #[test]
    fn filter_manifest_drops_internal_projects() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.xml");
        let output = dir.path().join("out.xml");
        std::fs::write(
            &input,
            r#"<manifest>
  <default remote="cros"/>
  <project name="chromiumos/a"/>
  <project name="chromeos/b" remote="cros-internal"/>
</manifest>"#,
        )
        .unwrap();

        let code = cmd_filter_manifest(&input, &output, &["cros".to_string()]).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        let names: Vec<String> = Manifest::load(&output)
            .unwrap()
            .projects()
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["chromiumos/a"]);
    }

    #[test]
    fn slaves_needs_known_master() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");
        std::fs::write(
            &path,
            "[[builders]]\nname = \"m\"\nmaster = true\nmanifest_version = true\n\n\
             [[builders]]\nname = \"s\"\nimportant = true\nmanifest_version = true\n",
        )
        .unwrap();
        assert!(cmd_slaves(&path, "m").is_ok());
        assert!(cmd_slaves(&path, "s").is_err());
        assert!(cmd_slaves(&path, "nope").is_err());
    }

    #[test]
    fn empty_result_exits_three() {
        assert_eq!(emit_path(None), ExitCode::from(EXIT_NOTHING));
    }
}
