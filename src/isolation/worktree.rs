//! Git worktree-backed workspace provisioning.
//!
//! Each workflow gets its own worktree branched off the configured source
//! ref, so concurrent pipelines never touch each other's checkouts.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use conveyor_common::WorkspaceProvisioner;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Provisions workspaces with `git worktree add` / `git worktree remove`.
pub struct GitWorktree {
    repo_root: PathBuf,
}

impl GitWorktree {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Branch created for a workspace, named after its directory.
    fn branch_for(path: &Path) -> String {
        let leaf = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        format!("conveyor/{}", leaf)
    }
}

#[async_trait]
impl WorkspaceProvisioner for GitWorktree {
    async fn create_workspace(&self, path: &Path, source_ref: &str) -> Result<()> {
        let parent = path
            .parent()
            .context("Workspace path has no parent directory")?;
        tokio::fs::create_dir_all(parent).await?;

        let path_str = path
            .to_str()
            .context("Workspace path contains invalid UTF-8")?;
        let branch = Self::branch_for(path);

        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch, path_str, source_ref])
            .current_dir(&self.repo_root)
            .output()
            .await
            .context("Failed to run git worktree add")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree add failed: {}", stderr.trim());
        }

        debug!(path = %path.display(), branch, "created worktree");
        Ok(())
    }

    async fn remove_workspace(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let removed = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        if !removed {
            // Half-created or unregistered directory: take it down directly.
            warn!(path = %path.display(), "git did not own the worktree, removing directory");
            tokio::fs::remove_dir_all(path)
                .await
                .with_context(|| format!("Failed to remove workspace {}", path.display()))?;
        }

        // Stale administrative entries are harmless but noisy.
        let _ = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_root)
            .output()
            .await;

        debug!(path = %path.display(), "removed worktree");
        Ok(())
    }
}
