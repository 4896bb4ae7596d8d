//! Per-job worktrees
//!
//! Each run gets a fresh worktree of the project, checked out on the job
//! branch, inside a temporary directory. The worktree is pruned from the
//! repository and deleted on release or drop.

use git2::{
    BranchType, IndexAddOption, Repository, Signature, WorktreeAddOptions, WorktreePruneOptions,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::{validate_branch_name, GitError};

const COMMIT_AUTHOR_NAME: &str = "Agent Jobs";
const COMMIT_AUTHOR_EMAIL: &str = "agent-jobs@localhost";

/// A checked-out worktree for one job branch
#[derive(Debug)]
pub struct JobWorkspace {
    repo_path: PathBuf,
    branch: String,
    worktree_name: String,
    worktree_path: PathBuf,
    dir: Option<TempDir>,
}

impl JobWorkspace {
    /// Check out `branch` in a new worktree under `root` (system temp dir when `None`).
    ///
    /// The branch is created from `base` when it does not exist yet and reused
    /// otherwise, so a resumed job keeps its earlier commits.
    pub async fn prepare(
        repo_path: &Path,
        branch: &str,
        base: &str,
        root: Option<&Path>,
    ) -> Result<Self, GitError> {
        let repo_path = repo_path.to_path_buf();
        let branch = branch.to_string();
        let base = base.to_string();
        let root = root.map(Path::to_path_buf);

        tokio::task::spawn_blocking(move || {
            Self::prepare_blocking(&repo_path, &branch, &base, root.as_deref())
        })
        .await
        .map_err(|e| GitError::Command(format!("Workspace task failed: {}", e)))?
    }

    fn prepare_blocking(
        repo_path: &Path,
        branch: &str,
        base: &str,
        root: Option<&Path>,
    ) -> Result<Self, GitError> {
        validate_branch_name(branch)?;
        validate_branch_name(base)?;

        let repo = Repository::open(repo_path)?;

        if repo.find_branch(branch, BranchType::Local).is_err() {
            let base_commit = repo
                .find_branch(base, BranchType::Local)
                .map_err(|e| GitError::RevisionNotFound {
                    revision: base.to_string(),
                    message: e.message().to_string(),
                })?
                .get()
                .peel_to_commit()?;
            repo.branch(branch, &base_commit, false)?;
            log::info!("[JobWorkspace] Created branch {} from {}", branch, base);
        }

        // Nested names would create nested dirs under .git/worktrees
        let worktree_name = branch.replace('/', "-");

        // A leftover registration (crashed run) keeps the branch checked out
        if let Ok(stale) = repo.find_worktree(&worktree_name) {
            log::warn!(
                "[JobWorkspace] Pruning stale worktree '{}' at {:?}",
                worktree_name,
                stale.path()
            );
            stale.prune(Some(
                WorktreePruneOptions::new().valid(true).working_tree(true),
            ))?;
        }

        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new()
                    .prefix("agent-job-")
                    .tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("agent-job-").tempdir()?,
        };
        let worktree_path = dir.path().join("worktree");

        let branch_ref = repo.find_branch(branch, BranchType::Local)?;
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));
        repo.worktree(&worktree_name, &worktree_path, Some(&opts))?;

        log::debug!(
            "[JobWorkspace] Worktree '{}' ready at {:?}",
            worktree_name,
            worktree_path
        );

        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            branch: branch.to_string(),
            worktree_name,
            worktree_path,
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Stage every change in the worktree and commit it onto the job branch.
    ///
    /// Returns the new commit id, or `None` when there was nothing to commit.
    /// Callers hold the branch write lock.
    pub async fn commit_all(&self, message: &str) -> Result<Option<String>, GitError> {
        let path = self.worktree_path.clone();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || commit_all_blocking(&path, &message))
            .await
            .map_err(|e| GitError::Command(format!("Commit task failed: {}", e)))?
    }

    /// Prune the worktree and delete its directory
    pub async fn release(mut self) -> Result<(), GitError> {
        let dir = self.dir.take();
        let repo_path = self.repo_path.clone();
        let name = self.worktree_name.clone();
        tokio::task::spawn_blocking(move || prune_worktree(&repo_path, &name, dir))
            .await
            .map_err(|e| GitError::Command(format!("Release task failed: {}", e)))?
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = prune_worktree(&self.repo_path, &self.worktree_name, Some(dir)) {
                log::warn!(
                    "[JobWorkspace] Failed to prune worktree '{}': {}",
                    self.worktree_name,
                    e
                );
            }
        }
    }
}

fn commit_all_blocking(worktree_path: &Path, message: &str) -> Result<Option<String>, GitError> {
    let repo = Repository::open(worktree_path)?;

    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    // picks up deletions, which add_all does not
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let parent = repo.head()?.peel_to_commit()?;
    if parent.tree_id() == tree_id {
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let signature = repo
        .signature()
        .or_else(|_| Signature::now(COMMIT_AUTHOR_NAME, COMMIT_AUTHOR_EMAIL))?;
    let oid = repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        message,
        &tree,
        &[&parent],
    )?;

    log::info!("[JobWorkspace] Committed {} in {:?}", oid, worktree_path);
    Ok(Some(oid.to_string()))
}

fn prune_worktree(repo_path: &Path, name: &str, dir: Option<TempDir>) -> Result<(), GitError> {
    let result = Repository::open(repo_path)
        .and_then(|repo| repo.find_worktree(name))
        .and_then(|worktree| {
            worktree.prune(Some(
                WorktreePruneOptions::new().valid(true).working_tree(true),
            ))
        });

    // The directory goes away whether or not git cooperated
    drop(dir);

    result.map_err(GitError::from)?;
    log::debug!("[JobWorkspace] Released worktree '{}'", name);
    Ok(())
}
