//! Git integration: local checkout state and remote branch heads.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;

use crate::domain::error::{GantryError, Result, TriggerError};
use crate::trigger::SourceProbe;

/// Capture the HEAD commit SHA from a git repository.
///
/// Runs `git rev-parse HEAD` in the given directory. Returns an error if the
/// directory is not inside a git repository or if git is not available.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| GantryError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GantryError::Git(format!("git rev-parse HEAD failed: {stderr}")));
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        return Err(GantryError::Git(
            "git rev-parse HEAD returned empty output".to_string(),
        ));
    }

    Ok(sha)
}

/// Name of the checked-out branch, or None on a detached HEAD.
pub fn current_branch(repo_dir: &Path) -> Result<Option<String>> {
    let output = Command::new("git")
        .args(["symbolic-ref", "--quiet", "--short", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| GantryError::Git(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        return Ok(None);
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!name.is_empty()).then_some(name))
}

/// Reads branch heads from a remote with `git ls-remote --heads`.
#[derive(Debug, Clone)]
pub struct GitRemoteProbe {
    remote: String,
    cwd: Option<PathBuf>,
}

impl GitRemoteProbe {
    /// `remote` is a URL, a local path, or a remote name resolved in `cwd`.
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

#[async_trait]
impl SourceProbe for GitRemoteProbe {
    async fn head_revision(&self, branch: &str) -> std::result::Result<Option<String>, TriggerError> {
        let unavailable = |message: String| TriggerError::SourceUnavailable {
            branch: branch.to_string(),
            message,
        };
        let full_ref = format!("refs/heads/{branch}");
        let mut cmd = AsyncCommand::new("git");
        cmd.args(["ls-remote", "--heads", &self.remote, &full_ref])
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| unavailable(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            return Err(unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_ls_remote(branch, &full_ref, &String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_ls_remote(
    branch: &str,
    full_ref: &str,
    listing: &str,
) -> std::result::Result<Option<String>, TriggerError> {
    for line in listing.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(sha), Some(name)) if sha.chars().all(|c| c.is_ascii_hexdigit()) => {
                if name == full_ref {
                    return Ok(Some(sha.to_ascii_lowercase()));
                }
            }
            _ => {
                return Err(TriggerError::MalformedListing {
                    branch: branch.to_string(),
                    line: line.to_string(),
                })
            }
        }
    }
    Ok(None)
}
