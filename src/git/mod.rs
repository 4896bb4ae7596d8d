//! Git operations for agent jobs
//!
//! This module provides git functionality organized into focused submodules:
//! - `branch_name` - Validation of every branch/base string before it reaches git
//! - `client` - `git diff` / `git diff --name-only` through the git binary
//! - `conflicts` - Overlapping file detection across job branches
//! - `locks` - Per-branch read/write locks shared by runners and the conflict detector
//! - `workspace` - Per-job worktrees, branch creation and auto-commit (git2)

mod branch_name;
mod client;
mod conflicts;
mod locks;
mod workspace;

use std::path::PathBuf;
use thiserror::Error;

use crate::models::JobId;

pub use branch_name::validate_branch_name;
pub use client::{GitClient, VcsClient, DEFAULT_BASE_BRANCH, MAX_DIFF_OUTPUT_BYTES};
pub use conflicts::{ConflictDetector, ConflictError, ConflictReport, FileOverlap};
pub use locks::BranchLocks;
pub use workspace::JobWorkspace;

/// Prefix of every job branch. The scheme is fixed: `agent-job-<jobId>`.
pub const JOB_BRANCH_PREFIX: &str = "agent-job-";

/// Branch name for a job
pub fn job_branch_name(job_id: JobId) -> String {
    format!("{}{}", JOB_BRANCH_PREFIX, job_id)
}

#[derive(Debug, Error)]
pub enum GitError {
    /// Untrusted branch/base string failed validation; nothing was spawned.
    #[error("Invalid branch name '{name}': {reason}")]
    InvalidBranchName { name: String, reason: &'static str },

    /// git reported that a referenced branch/base does not exist.
    #[error("Revision not found for '{revision}': {message}")]
    RevisionNotFound { revision: String, message: String },

    /// Any other non-zero exit or output-size violation.
    #[error("git command failed: {0}")]
    Command(String),

    #[error("Repository path must be absolute: {0:?}")]
    InvalidRepoPath(PathBuf),

    #[error("Repository error: {0}")]
    Repository(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub fn is_revision_not_found(&self) -> bool {
        matches!(self, GitError::RevisionNotFound { .. })
    }
}
