//! Source tree management.
//!
//! One checkout per project under the base directory, guarded by a
//! per-project mutex. Every mutating source operation and every agent
//! execution for a project runs while holding that lock; the returned
//! owned guard is the unlock handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use sentinel_config::Project;

use crate::error::SentinelError;

/// Manages checkouts and the per-project locks.
pub struct SourceManager {
    base_dir: PathBuf,
    ssh_key: Option<String>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Unlock handle for a project lock; releases on drop.
pub type ProjectLock = OwnedMutexGuard<()>;

impl SourceManager {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, ssh_key: Option<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ssh_key: ssh_key.filter(|k| !k.is_empty()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the project's mutex, creating it on first use.
    pub async fn lock(&self, project_key: &str) -> ProjectLock {
        let mutex = {
            let mut locks = self.locks.lock().expect("lock map poisoned");
            Arc::clone(
                locks
                    .entry(project_key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        mutex.lock_owned().await
    }

    /// Checkout directory for a project.
    #[must_use]
    pub fn repo_dir(&self, project_key: &str) -> PathBuf {
        self.base_dir.join(project_key)
    }

    /// Directory handed to the agent: the checkout joined with the
    /// project's source root.
    #[must_use]
    pub fn source_path(&self, project: &Project) -> PathBuf {
        let repo = self.repo_dir(&project.key);
        if project.source_root.is_empty() {
            repo
        } else {
            repo.join(&project.source_root)
        }
    }

    /// Environment for git subprocesses (SSH identity, if configured).
    #[must_use]
    pub fn git_env(&self) -> Vec<(String, String)> {
        match &self.ssh_key {
            Some(key) => vec![(
                "GIT_SSH_COMMAND".to_string(),
                format!(
                    "ssh -i '{}' -o StrictHostKeyChecking=no",
                    shell_single_quote(key)
                ),
            )],
            None => Vec::new(),
        }
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, SentinelError> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.args(args);
        for (key, value) in self.git_env() {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| SentinelError::SourceCommand(format!("git {}: {e}", args.join(" "))))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SentinelError::SourceCommand(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Snapshot the project's repository and return the path handed to the
    /// agent.
    ///
    /// An existing checkout is fetched and hard-reset to the configured
    /// branch; when that fails the directory is removed and a shallow
    /// single-branch clone takes its place.
    pub async fn prepare(&self, project: &Project) -> Result<PathBuf, SentinelError> {
        let repo = self.repo_dir(&project.key);

        if repo.join(".git").is_dir() {
            match self.refresh(&repo, &project.branch).await {
                Ok(()) => {
                    debug!(project = %project.key, "checkout refreshed");
                    return Ok(self.source_path(project));
                }
                Err(e) => {
                    warn!(project = %project.key, error = %e, "refresh failed, recloning");
                    tokio::fs::remove_dir_all(&repo).await.map_err(|e| {
                        SentinelError::SourcePrepare(format!(
                            "remove {}: {e}",
                            repo.display()
                        ))
                    })?;
                }
            }
        }

        if let Some(parent) = repo.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SentinelError::SourcePrepare(format!("create base dir: {e}")))?;
        }

        info!(project = %project.key, branch = %project.branch, "cloning");
        let repo_path = repo.to_string_lossy().to_string();
        self.git(
            None,
            &[
                "clone",
                "--depth=1",
                "--single-branch",
                "--branch",
                &project.branch,
                &project.repo_url,
                repo_path.as_str(),
            ],
        )
        .await
        .map_err(|e| SentinelError::SourcePrepare(e.to_string()))?;

        Ok(self.source_path(project))
    }

    async fn refresh(&self, repo: &Path, branch: &str) -> Result<(), SentinelError> {
        self.git(Some(repo), &["fetch", "--depth=1", "origin", branch])
            .await?;
        self.git(Some(repo), &["reset", "--hard", "FETCH_HEAD"])
            .await?;
        Ok(())
    }

    /// Short revision of `HEAD`; empty when it cannot be read.
    pub async fn revision(&self, project_key: &str) -> Result<String, SentinelError> {
        let out = self
            .git(Some(&self.repo_dir(project_key)), &["rev-parse", "--short", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Whether the working tree reports any modified, untracked or renamed
    /// file. Callers treat an error here as tainting (fail-closed).
    pub async fn has_changes(&self, project_key: &str) -> Result<bool, SentinelError> {
        let out = self
            .git(Some(&self.repo_dir(project_key)), &["status", "--porcelain"])
            .await?;
        Ok(!out.trim().is_empty())
    }

    /// Revert tracked changes and remove untracked files.
    pub async fn reset_changes(&self, project_key: &str) -> Result<(), SentinelError> {
        let repo = self.repo_dir(project_key);
        self.git(Some(&repo), &["checkout", "--", "."]).await?;
        self.git(Some(&repo), &["clean", "-fd"]).await?;
        Ok(())
    }
}

/// Escape embedded single quotes for inclusion inside a single-quoted
/// shell word.
fn shell_single_quote(s: &str) -> String {
    s.replace('\'', r"'\''")
}
