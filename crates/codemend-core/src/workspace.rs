use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::runner::{Runner, ToolOutput};

/// One ephemeral on-disk clone, keyed by (owner, repo, commit hash).
///
/// The directory is exclusive to a single run and is deleted on every exit
/// path — success, no-op, duplicate, or failure. Operations that fail
/// delete the directory before the error propagates; the `Drop` impl is the
/// backstop for paths that never reach an explicit removal.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    runner: Runner,
}

impl Workspace {
    /// Deterministic workspace location for a run.
    pub fn path_for(base: &Path, owner: &str, repo: &str, commit: &str) -> PathBuf {
        base.join(owner).join(repo).join(commit)
    }

    /// Deterministic remediation branch name for a commit.
    pub fn branch_name(tool: &str, commit: &str) -> String {
        format!("remediation/{tool}/{commit}")
    }

    /// Clone `remote_url` into the deterministic path, deleting any stale
    /// workspace left behind for the same key first.
    pub async fn clone_fresh(
        runner: Runner,
        base: &Path,
        owner: &str,
        repo: &str,
        commit: &str,
        remote_url: &str,
    ) -> Result<Self> {
        let path = Self::path_for(base, owner, repo, commit);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
            info!("removed stale workspace {}", path.display());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().into_owned();
        runner
            .run("git", &["clone", remote_url, &path_str], None, None)
            .await
            .map_err(|e| {
                // Keep credentials out of the error payload.
                let detail = match e {
                    Error::Command { status, stderr, .. } => {
                        format!("git clone exited with status {status}: {stderr}")
                    }
                    other => other.to_string(),
                };
                Error::CloneFailed(format!("{owner}/{repo}: {detail}"))
            })?;

        info!("cloned {owner}/{repo} at {commit} into {}", path.display());
        Ok(Self { path, runner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn git(&self, args: &[&str]) -> Result<ToolOutput> {
        self.runner.run("git", args, Some(&self.path), None).await
    }

    /// Run a git operation, deleting the workspace before a failure
    /// propagates.
    async fn git_or_cleanup(&self, args: &[&str]) -> Result<ToolOutput> {
        match self.git(args).await {
            Ok(out) => Ok(out),
            Err(e) => {
                self.remove().await;
                Err(e)
            }
        }
    }

    pub async fn create_branch(&self, name: &str) -> Result<()> {
        self.git_or_cleanup(&["checkout", "-b", name]).await?;
        info!("created branch {name}");
        Ok(())
    }

    /// Capture the diff of an already-open proposal branch against the
    /// remote default branch, restoring the default branch and deleting the
    /// temporary local ref afterwards. The four git steps are one logical
    /// operation: any failure deletes the workspace.
    pub async fn existing_proposal_diff(&self, proposal_ref: &str) -> Result<String> {
        self.git_or_cleanup(&["fetch", "--all"]).await?;
        self.git_or_cleanup(&["checkout", proposal_ref]).await?;
        let diff = self
            .git_or_cleanup(&["diff", &format!("origin...{proposal_ref}"), "--no-prefix"])
            .await?;
        let head = self
            .git_or_cleanup(&["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await?;
        let default_branch = head
            .stdout
            .trim()
            .rsplit('/')
            .next()
            .unwrap_or("main")
            .to_string();
        self.git_or_cleanup(&["checkout", &default_branch]).await?;
        self.git_or_cleanup(&["branch", "-D", proposal_ref]).await?;
        Ok(diff.stdout)
    }

    /// True iff the working tree has uncommitted modifications. A clean
    /// tree means there is nothing to propose, so the workspace is deleted
    /// immediately.
    pub async fn has_changes(&self) -> Result<bool> {
        let status = self.git_or_cleanup(&["status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            info!("no changes in {}", self.path.display());
            self.remove().await;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn diff(&self) -> Result<String> {
        let out = self.git_or_cleanup(&["diff", "--no-prefix"]).await?;
        Ok(out.stdout)
    }

    pub async fn commit_all(&self, message: &str) -> Result<()> {
        self.git_or_cleanup(&["add", "."]).await?;
        self.git_or_cleanup(&["commit", "-m", message, "--no-verify"])
            .await?;
        Ok(())
    }

    pub async fn push(&self, branch: &str, remote_url: &str) -> Result<()> {
        self.git_or_cleanup(&["push", remote_url, branch]).await?;
        info!("pushed branch {branch}");
        Ok(())
    }

    /// Delete the on-disk workspace. Best-effort; never fails the run.
    pub async fn remove(&self) {
        if !self.path.exists() {
            return;
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => info!("removed workspace {}", self.path.display()),
            Err(e) => warn!("failed to remove workspace {}: {e}", self.path.display()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("failed to remove workspace {}: {e}", self.path.display());
            }
        }
    }
}
