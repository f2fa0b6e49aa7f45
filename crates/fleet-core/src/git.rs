//! Git plumbing for the manifest-versions clone and source projects.
//!
//! [`GitOps`] is the seam the candidate store publishes through; [`GitCli`]
//! drives the `git` binary.

use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CoreError, Result};

/// Local branch every publish is committed on.
pub const PUSH_BRANCH: &str = "temp_auto_checkin_branch";

/// What happened to a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The remote moved underneath us; refresh and try again.
    Rejected,
}

#[async_trait]
pub trait GitOps: Send + Sync {
    /// Make `repo` an exact clean copy of `branch` at `url`, cloning if needed.
    async fn refresh(&self, repo: &Path, url: &str, branch: &str) -> Result<()>;

    /// Check out [`PUSH_BRANCH`] at the tip of `origin/<branch>`.
    async fn create_push_branch(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Stage everything and commit. Returns false when there was nothing to commit.
    async fn commit_all(&self, repo: &Path, message: &str) -> Result<bool>;

    async fn push(&self, repo: &Path, branch: &str, dry_run: bool) -> Result<PushOutcome>;

    /// `git log --pretty=full <rev>..HEAD`, or `None` if `rev` is unknown to `repo`.
    async fn log_since(&self, repo: &Path, rev: &str) -> Result<Option<String>>;
}

/// [`GitOps`] over the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    user_name: String,
    user_email: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::with_identity("fleet-bot", "fleet-bot@localhost")
    }
}

impl GitCli {
    /// Commit as `name <email>` regardless of the host's git config.
    pub fn with_identity(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_name: name.into(),
            user_email: email.into(),
        }
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        debug!(dir = %dir.display(), ?args, "git");
        Command::new("git")
            .arg("-c")
            .arg(format!("user.name={}", self.user_name))
            .arg("-c")
            .arg(format!("user.email={}", self.user_email))
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CoreError::Git(format!("failed to run git: {e}")))
    }

    async fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.run(dir, args).await?;
        if !output.status.success() {
            return Err(CoreError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_rejection(stderr: &str) -> bool {
    ["[rejected]", "non-fast-forward", "fetch first", "cannot lock ref"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

#[async_trait]
impl GitOps for GitCli {
    async fn refresh(&self, repo: &Path, url: &str, branch: &str) -> Result<()> {
        if !repo.join(".git").exists() {
            let parent = repo
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = repo
                .file_name()
                .ok_or_else(|| CoreError::Git(format!("bad clone path {}", repo.display())))?
                .to_string_lossy();
            tokio::fs::create_dir_all(parent).await?;
            self.run_checked(parent, &["clone", "--branch", branch, url, &name])
                .await?;
            return Ok(());
        }

        self.run_checked(repo, &["fetch", "--prune", "origin"]).await?;
        let upstream = format!("origin/{branch}");
        self.run_checked(repo, &["checkout", "-f", "-B", branch, &upstream])
            .await?;
        self.run_checked(repo, &["clean", "-dfx"]).await?;
        Ok(())
    }

    async fn create_push_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        let upstream = format!("origin/{branch}");
        self.run_checked(repo, &["checkout", "-f", "-B", PUSH_BRANCH, &upstream])
            .await?;
        Ok(())
    }

    async fn commit_all(&self, repo: &Path, message: &str) -> Result<bool> {
        self.run_checked(repo, &["add", "-A"]).await?;
        let staged = self.run(repo, &["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            return Ok(false);
        }
        self.run_checked(repo, &["commit", "-m", message]).await?;
        Ok(true)
    }

    async fn push(&self, repo: &Path, branch: &str, dry_run: bool) -> Result<PushOutcome> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let mut args = vec!["push"];
        if dry_run {
            args.push("--dry-run");
        }
        args.extend(["origin", refspec.as_str()]);

        let output = self.run(repo, &args).await?;
        if output.status.success() {
            return Ok(PushOutcome::Pushed);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_rejection(&stderr) {
            debug!(branch, "push rejected");
            return Ok(PushOutcome::Rejected);
        }
        Err(CoreError::Git(format!("git push failed: {}", stderr.trim())))
    }

    async fn log_since(&self, repo: &Path, rev: &str) -> Result<Option<String>> {
        let range = format!("{rev}..HEAD");
        let output = self.run(repo, &["log", "--pretty=full", &range]).await?;
        match output.status.code() {
            Some(0) => Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned())),
            Some(128) => Ok(None),
            _ => Err(CoreError::Git(format!(
                "git log {range} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

/// Capture the HEAD commit SHA of a git repository.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| CoreError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoreError::Git(format!("git rev-parse HEAD failed: {stderr}")));
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        return Err(CoreError::Git(
            "git rev-parse HEAD returned empty output".to_string(),
        ));
    }
    Ok(sha)
}
