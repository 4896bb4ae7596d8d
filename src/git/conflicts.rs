// Conflict detection across job branches
//
// A conflict is a file touched by the branches of two or more jobs relative to
// the same base branch. Reports are recomputed on every call.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::{
    job_branch_name, validate_branch_name, BranchLocks, GitError, VcsClient, DEFAULT_BASE_BRANCH,
};
use crate::models::JobId;

/// One file changed by several jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileOverlap {
    pub file: String,
    /// Always at least two ids, ascending
    pub job_ids: Vec<JobId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub has_conflicts: bool,
    pub overlapping_files: Vec<FileOverlap>,
}

impl ConflictReport {
    pub fn empty() -> Self {
        Self::default()
    }

    fn from_overlaps(overlapping_files: Vec<FileOverlap>) -> Self {
        Self {
            has_conflicts: !overlapping_files.is_empty(),
            overlapping_files,
        }
    }
}

/// Caller errors. Per-job git failures are not errors: they are logged and skipped.
#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Job {0} listed more than once")]
    DuplicateJobId(JobId),

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Conflict detector for identifying files changed by more than one job
pub struct ConflictDetector {
    repo_path: PathBuf,
    base_branch: String,
    client: Arc<dyn VcsClient>,
    locks: Arc<BranchLocks>,
}

impl ConflictDetector {
    /// Create a detector comparing job branches against `main`
    pub fn new(
        repo_path: impl AsRef<Path>,
        client: Arc<dyn VcsClient>,
        locks: Arc<BranchLocks>,
    ) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            client,
            locks,
        }
    }

    pub fn with_base_branch(mut self, base_branch: impl Into<String>) -> Self {
        self.base_branch = base_branch.into();
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Report every file changed by two or more of the given jobs.
    ///
    /// Job order is not significant. Fewer than two jobs never touches git.
    pub async fn check_conflicts(&self, job_ids: &[JobId]) -> Result<ConflictReport, ConflictError> {
        validate_branch_name(&self.base_branch)?;

        let mut ids = job_ids.to_vec();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConflictError::DuplicateJobId(pair[0]));
        }

        if ids.len() < 2 {
            return Ok(ConflictReport::empty());
        }

        // Branches are independent, so fetch them concurrently
        let results = join_all(ids.iter().map(|&id| self.changed_files_for_job(id))).await;

        // Ascending traversal keeps each job list ascending
        let mut file_jobs: BTreeMap<String, Vec<JobId>> = BTreeMap::new();
        for (&job_id, result) in ids.iter().zip(results) {
            match result {
                Ok(files) => {
                    for file in files {
                        let jobs = file_jobs.entry(file).or_default();
                        if jobs.last() != Some(&job_id) {
                            jobs.push(job_id);
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "[ConflictDetector] Skipping job {} ({}): {}",
                        job_id,
                        job_branch_name(job_id),
                        e
                    );
                }
            }
        }

        let overlaps: Vec<FileOverlap> = file_jobs
            .into_iter()
            .filter(|(_, jobs)| jobs.len() >= 2)
            .map(|(file, job_ids)| FileOverlap { file, job_ids })
            .collect();

        log::debug!(
            "[ConflictDetector] Checked {} jobs, {} overlapping files",
            ids.len(),
            overlaps.len()
        );

        Ok(ConflictReport::from_overlaps(overlaps))
    }

    /// Full diff of a job branch against the base branch
    pub async fn diff_for_job(&self, job_id: JobId) -> Result<String, GitError> {
        let branch = job_branch_name(job_id);
        let _guard = self.locks.read(&branch).await;
        self.client
            .diff(&self.repo_path, &branch, &self.base_branch)
            .await
    }

    async fn changed_files_for_job(&self, job_id: JobId) -> Result<Vec<String>, GitError> {
        let branch = job_branch_name(job_id);
        let _guard = self.locks.read(&branch).await;
        self.client
            .changed_files(&self.repo_path, &branch, &self.base_branch)
            .await
    }
}
