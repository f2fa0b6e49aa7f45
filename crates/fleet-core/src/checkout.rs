//! Source checkout collaborator.
//!
//! The coordinator never touches the source tree directly: it syncs it,
//! asks it for the version it is at and for a revision-pinned manifest.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::manifest::{Manifest, Project};
use crate::version::VersionNumber;

#[async_trait]
pub trait SourceCheckout: Send + Sync {
    /// Sync to `manifest` if given, otherwise to the tip of every project.
    async fn sync(&self, manifest: Option<&Path>) -> Result<()>;

    /// Version recorded in the checkout's version file.
    async fn current_version(&self) -> Result<VersionNumber>;

    /// A manifest pinning every project to its checked-out revision.
    async fn export_manifest(&self) -> Result<Manifest>;

    /// Local directory of `project`.
    fn project_dir(&self, project: &Project) -> PathBuf;

    /// Whether the checkout is at exactly the revisions `manifest` pins.
    async fn matches_manifest(&self, manifest: &Manifest) -> Result<bool> {
        Ok(self.export_manifest().await?.same_revisions(manifest)?)
    }
}

/// [`SourceCheckout`] over a `repo`-managed tree.
#[derive(Debug, Clone)]
pub struct RepoCheckout {
    root: PathBuf,
    version_file: PathBuf,
}

impl RepoCheckout {
    /// `version_file` is relative to `root`.
    pub fn new(root: impl Into<PathBuf>, version_file: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            version_file: version_file.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn repo(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("repo")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CoreError::Checkout(format!("failed to run repo: {e}")))?;
        if !output.status.success() {
            return Err(CoreError::Checkout(format!(
                "repo {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SourceCheckout for RepoCheckout {
    async fn sync(&self, manifest: Option<&Path>) -> Result<()> {
        match manifest {
            Some(path) => {
                info!(manifest = %path.display(), "syncing checkout to manifest");
                let path = path.to_string_lossy();
                self.repo(&["sync", "--force-sync", "-m", &path]).await?;
            }
            None => {
                info!("syncing checkout to tip");
                self.repo(&["sync", "--force-sync"]).await?;
            }
        }
        Ok(())
    }

    async fn current_version(&self) -> Result<VersionNumber> {
        let path = self.root.join(&self.version_file);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CoreError::Checkout(format!("reading {}: {e}", path.display())))?;
        Ok(VersionNumber::from_version_file(&text)?)
    }

    async fn export_manifest(&self) -> Result<Manifest> {
        let xml = self.repo(&["manifest", "-r", "-o", "-"]).await?;
        Ok(Manifest::parse(&xml)?)
    }

    fn project_dir(&self, project: &Project) -> PathBuf {
        self.root.join(project.checkout_path())
    }
}
