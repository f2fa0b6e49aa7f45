//! In-memory collaborators for tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::checkout::SourceCheckout;
use crate::error::Result;
use crate::git::{GitOps, PushOutcome};
use crate::manifest::{Manifest, Project};
use crate::version::VersionNumber;

/// A checkout whose version and pinned manifest are set by the test.
#[derive(Debug)]
pub struct FakeCheckout {
    root: PathBuf,
    version: Mutex<VersionNumber>,
    manifest: Mutex<Manifest>,
    syncs: Mutex<Vec<Option<PathBuf>>>,
}

impl FakeCheckout {
    /// Project directories resolve under `root`.
    pub fn new(root: impl Into<PathBuf>, version: VersionNumber, manifest: Manifest) -> Self {
        Self {
            root: root.into(),
            version: Mutex::new(version),
            manifest: Mutex::new(manifest),
            syncs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_version(&self, version: VersionNumber) {
        *self.version.lock().unwrap() = version;
    }

    pub fn set_manifest(&self, manifest: Manifest) {
        *self.manifest.lock().unwrap() = manifest;
    }

    /// Every `sync` call so far, in order.
    pub fn syncs(&self) -> Vec<Option<PathBuf>> {
        self.syncs.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceCheckout for FakeCheckout {
    async fn sync(&self, manifest: Option<&Path>) -> Result<()> {
        if let Some(path) = manifest {
            self.set_manifest(Manifest::load(path)?);
        }
        self.syncs
            .lock()
            .unwrap()
            .push(manifest.map(Path::to_path_buf));
        Ok(())
    }

    async fn current_version(&self) -> Result<VersionNumber> {
        Ok(self.version.lock().unwrap().clone())
    }

    async fn export_manifest(&self) -> Result<Manifest> {
        Ok(self.manifest.lock().unwrap().clone())
    }

    fn project_dir(&self, project: &Project) -> PathBuf {
        self.root.join(project.checkout_path())
    }
}

/// A git that never touches disk. Pushes follow a script, then `fallback`.
#[derive(Debug)]
pub struct ScriptedGit {
    script: Mutex<VecDeque<PushOutcome>>,
    fallback: PushOutcome,
    pushes: Mutex<u32>,
}

impl ScriptedGit {
    /// Every push succeeds.
    pub fn new() -> Self {
        Self::with_script([], PushOutcome::Pushed)
    }

    pub fn with_script(script: impl IntoIterator<Item = PushOutcome>, fallback: PushOutcome) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            pushes: Mutex::new(0),
        }
    }

    pub fn pushes(&self) -> u32 {
        *self.pushes.lock().unwrap()
    }
}

impl Default for ScriptedGit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitOps for ScriptedGit {
    async fn refresh(&self, _repo: &Path, _url: &str, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn create_push_branch(&self, _repo: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    async fn commit_all(&self, _repo: &Path, _message: &str) -> Result<bool> {
        Ok(true)
    }

    async fn push(&self, _repo: &Path, _branch: &str, _dry_run: bool) -> Result<PushOutcome> {
        *self.pushes.lock().unwrap() += 1;
        Ok(self.script.lock().unwrap().pop_front().unwrap_or(self.fallback))
    }

    async fn log_since(&self, _repo: &Path, _rev: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_to_manifest_adopts_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinned.xml");
        std::fs::write(
            &path,
            r#"<manifest><project name="a" revision="1111"/></manifest>"#,
        )
        .unwrap();

        let checkout = FakeCheckout::new(
            dir.path(),
            "1.0.0".parse().unwrap(),
            Manifest::new(),
        );
        checkout.sync(Some(&path)).await.unwrap();

        let exported = checkout.export_manifest().await.unwrap();
        assert_eq!(exported.revisions().unwrap()["a"], "1111");
        assert_eq!(checkout.syncs(), vec![Some(path)]);
    }

    #[tokio::test]
    async fn scripted_git_follows_script() {
        let git = ScriptedGit::with_script([PushOutcome::Rejected], PushOutcome::Pushed);
        let repo = Path::new("/nowhere");
        assert_eq!(git.push(repo, "master", false).await.unwrap(), PushOutcome::Rejected);
        assert_eq!(git.push(repo, "master", false).await.unwrap(), PushOutcome::Pushed);
        assert_eq!(git.pushes(), 2);
    }
}
