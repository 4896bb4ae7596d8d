// Integration tests for conflict detection over real repositories
// Branches are built with git2; diffs need a git binary and are skipped without one

use git2::{Repository, RepositoryInitOptions, Signature};
use std::path::PathBuf;
use tempfile::TempDir;

use agent_jobs_lib::{build_orchestrator, AppConfig, GitError};

fn git_available() -> bool {
    which::which("git").is_ok()
}

fn signature() -> Signature<'static> {
    Signature::now("Test", "test@example.com").unwrap()
}

/// Repository with `main` holding README.md and lib.rs
fn init_repo() -> (TempDir, Repository) {
    let dir = TempDir::new().unwrap();
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir.path(), &opts).unwrap();

    {
        let tree_id = {
            let mut builder = repo.treebuilder(None).unwrap();
            for (name, content) in [("README.md", "# Project\n"), ("lib.rs", "pub fn a() {}\n")] {
                let blob = repo.blob(content.as_bytes()).unwrap();
                builder.insert(name, blob, 0o100644).unwrap();
            }
            builder.write().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("refs/heads/main"), &signature(), &signature(), "init", &tree, &[])
            .unwrap();
    }

    (dir, repo)
}

/// Commit flat files onto `branch`, creating it from main when missing
fn commit_on_branch(repo: &Repository, branch: &str, files: &[(&str, &str)]) {
    let refname = format!("refs/heads/{}", branch);
    if repo.find_reference(&refname).is_err() {
        let main = repo.find_branch("main", git2::BranchType::Local).unwrap();
        let main_commit = main.get().peel_to_commit().unwrap();
        repo.branch(branch, &main_commit, false).unwrap();
    }

    let parent = repo
        .find_reference(&refname)
        .unwrap()
        .peel_to_commit()
        .unwrap();
    let tree_id = {
        let mut builder = repo.treebuilder(Some(&parent.tree().unwrap())).unwrap();
        for (name, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            builder.insert(*name, blob, 0o100644).unwrap();
        }
        builder.write().unwrap()
    };
    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(
        Some(&refname),
        &signature(),
        &signature(),
        "job work",
        &tree,
        &[&parent],
    )
    .unwrap();
}

fn repo_path(dir: &TempDir) -> PathBuf {
    dir.path().canonicalize().unwrap()
}

#[tokio::test]
async fn test_overlapping_branches_are_reported() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let (dir, repo) = init_repo();
    commit_on_branch(&repo, "agent-job-1", &[("lib.rs", "pub fn a() { 1 }\n"), ("one.rs", "1")]);
    commit_on_branch(&repo, "agent-job-2", &[("lib.rs", "pub fn a() { 2 }\n"), ("two.rs", "2")]);
    commit_on_branch(&repo, "agent-job-3", &[("three.rs", "3"), ("two.rs", "two")]);

    let path = repo_path(&dir);
    let orchestrator = build_orchestrator(&path, &AppConfig::default());

    let report = orchestrator.check_conflicts(&[3, 1, 2]).await.unwrap();
    assert!(report.has_conflicts);
    let files: Vec<(&str, Vec<u64>)> = report
        .overlapping_files
        .iter()
        .map(|o| (o.file.as_str(), o.job_ids.clone()))
        .collect();
    assert_eq!(files, vec![("lib.rs", vec![1, 2]), ("two.rs", vec![2, 3])]);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["hasConflicts"], true);
    assert_eq!(json["overlappingFiles"][0]["jobIds"], serde_json::json!([1, 2]));
}

#[tokio::test]
async fn test_disjoint_branches_and_missing_job_branch() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let (dir, repo) = init_repo();
    commit_on_branch(&repo, "agent-job-1", &[("one.rs", "1")]);
    commit_on_branch(&repo, "agent-job-2", &[("two.rs", "2")]);

    let path = repo_path(&dir);
    let orchestrator = build_orchestrator(&path, &AppConfig::default());

    // Job 4 has no branch yet; it is skipped rather than failing the check
    let report = orchestrator.check_conflicts(&[1, 2, 4]).await.unwrap();
    assert!(!report.has_conflicts);
    assert!(report.overlapping_files.is_empty());
}

#[tokio::test]
async fn test_job_diff_against_base() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let (dir, repo) = init_repo();
    commit_on_branch(&repo, "agent-job-5", &[("README.md", "# Project\n\nMore docs\n")]);

    let path = repo_path(&dir);
    let orchestrator = build_orchestrator(&path, &AppConfig::default());

    let diff = orchestrator.diff(5).await.unwrap();
    assert!(diff.contains("README.md"));
    assert!(diff.contains("+More docs"));

    let err = orchestrator.diff(6).await.unwrap_err();
    assert!(matches!(err, GitError::RevisionNotFound { .. }));
}

#[tokio::test]
async fn test_single_job_needs_no_repository() {
    let dir = TempDir::new().unwrap();
    let path = repo_path(&dir);
    let orchestrator = build_orchestrator(&path, &AppConfig::default());

    let report = orchestrator.check_conflicts(&[1]).await.unwrap();
    assert!(!report.has_conflicts);
    assert!(orchestrator.check_conflicts(&[1, 1]).await.is_err());
}
