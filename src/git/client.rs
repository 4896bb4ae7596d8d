//! Diff queries through the git binary
//!
//! Every invocation is an argument vector (never a shell string), runs with the
//! project root as working directory, and caps stdout at [`MAX_DIFF_OUTPUT_BYTES`].

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{validate_branch_name, GitError};

/// Base branch used when the caller does not name one
pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Hard ceiling on captured diff output (10 MiB). Exceeding it is an error.
pub const MAX_DIFF_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Cap on captured stderr, only used for error messages
const MAX_STDERR_BYTES: u64 = 64 * 1024;

static REVISION_NOT_FOUND_PATTERN: OnceLock<Regex> = OnceLock::new();

fn revision_not_found_pattern() -> &'static Regex {
    REVISION_NOT_FOUND_PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(unknown revision|bad revision|ambiguous argument|not a valid object name|invalid symmetric difference)",
        )
        .unwrap()
    })
}

/// Read-only diff queries against a project checkout.
///
/// `branch` and `base` are validated with [`validate_branch_name`] before any
/// process is spawned.
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Changes introduced by `branch` since it diverged from `base` (`git diff base...branch`)
    async fn diff(&self, repo_path: &Path, branch: &str, base: &str) -> Result<String, GitError>;

    /// Repo-relative paths touched by `branch` since it diverged from `base`
    async fn changed_files(
        &self,
        repo_path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<Vec<String>, GitError>;
}

/// [`VcsClient`] backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitClient {
    git_binary: PathBuf,
    max_output_bytes: usize,
}

impl GitClient {
    pub fn new() -> Self {
        Self::with_binary("git")
    }

    pub fn with_binary(git_binary: impl Into<PathBuf>) -> Self {
        Self {
            git_binary: git_binary.into(),
            max_output_bytes: MAX_DIFF_OUTPUT_BYTES,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_output_limit(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    async fn run_diff(
        &self,
        repo_path: &Path,
        branch: &str,
        base: &str,
        extra_args: &[&str],
    ) -> Result<String, GitError> {
        validate_branch_name(branch)?;
        validate_branch_name(base)?;
        if !repo_path.is_absolute() {
            return Err(GitError::InvalidRepoPath(repo_path.to_path_buf()));
        }

        let range = format!("{}...{}", base, branch);
        log::debug!("[GitClient] git diff {:?} {} in {:?}", extra_args, range, repo_path);

        let mut child = Command::new(&self.git_binary)
            .args(["-c", "core.quotePath=false", "diff", "--no-color", "--no-ext-diff"])
            .args(extra_args)
            .arg(&range)
            .arg("--")
            .current_dir(repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GitError::Command(format!("Failed to spawn git: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GitError::Command("Failed to capture git stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GitError::Command("Failed to capture git stderr".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut stderr = stderr;
            let mut buf = Vec::new();
            let _ = (&mut stderr)
                .take(MAX_STDERR_BYTES)
                .read_to_end(&mut buf)
                .await;
            // keep draining so git never blocks on a full stderr pipe
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            buf
        });

        // Read one byte past the ceiling so an overflow is detectable
        let mut output = Vec::new();
        stdout
            .take(self.max_output_bytes as u64 + 1)
            .read_to_end(&mut output)
            .await?;

        if output.len() > self.max_output_bytes {
            let _ = child.kill().await;
            stderr_task.abort();
            return Err(GitError::Command(format!(
                "git diff output for {} exceeded the {} byte ceiling",
                range, self.max_output_bytes
            )));
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let message = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(classify_failure(&range, status.code(), message));
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsClient for GitClient {
    async fn diff(&self, repo_path: &Path, branch: &str, base: &str) -> Result<String, GitError> {
        self.run_diff(repo_path, branch, base, &[]).await
    }

    async fn changed_files(
        &self,
        repo_path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<Vec<String>, GitError> {
        let output = self
            .run_diff(repo_path, branch, base, &["--name-only"])
            .await?;
        Ok(parse_name_only(&output))
    }
}

/// Split `--name-only` output into paths, dropping blank lines
fn parse_name_only(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(String::from)
        .collect()
}

/// Separate "that revision does not exist" from every other git failure
fn classify_failure(range: &str, code: Option<i32>, message: String) -> GitError {
    if revision_not_found_pattern().is_match(&message) {
        GitError::RevisionNotFound {
            revision: range.to_string(),
            message,
        }
    } else {
        GitError::Command(format!(
            "git diff {} exited with {:?}: {}",
            range, code, message
        ))
    }
}
