#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::derivable_impls)] // Explicit Default impls can be clearer

pub mod agents;
pub mod config;
pub mod events;
pub mod git;
pub mod models;
pub mod orchestrator;
pub mod shutdown;
mod utils;

pub use models::*;

pub use agents::{AgentEvent, AgentRun, AgentRunner, DefaultRunnerFactory, RunnerError, RunnerFactory};
pub use config::AppConfig;
pub use events::{EventBroadcaster, EventFeed};
pub use git::{BranchLocks, ConflictDetector, ConflictReport, GitClient, GitError};
pub use orchestrator::{JobMutation, JobOrchestrator, OrchestratorError, OrchestratorSettings};

use std::path::Path;
use std::sync::Arc;

/// Wire an orchestrator for `repo_path` from a loaded configuration.
///
/// `repo_path` must be absolute.
pub fn build_orchestrator(repo_path: &Path, config: &AppConfig) -> JobOrchestrator {
    let locks = Arc::new(BranchLocks::new());
    let base_branch = config.git.base_branch.clone();

    let git_binary = agents::CliPathResolver::resolve_git(&config.git.git_binary)
        .unwrap_or_else(|| config.git.git_binary.clone());
    let detector = ConflictDetector::new(
        repo_path,
        Arc::new(GitClient::with_binary(git_binary)),
        locks.clone(),
    )
    .with_base_branch(base_branch.clone());

    let factory = DefaultRunnerFactory::new(repo_path, locks, config.runner_settings())
        .with_base_branch(base_branch);

    JobOrchestrator::new(
        Arc::new(factory),
        Arc::new(EventBroadcaster::with_capacity(config.broadcast.buffer_size)),
        Arc::new(detector),
        config.orchestrator_settings(),
    )
}
