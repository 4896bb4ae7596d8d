// Agent runner contract and the factory that picks a variant per job

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::container::ContainerRunner;
use super::events::AgentEvent;
use super::sandbox::SandboxRunner;
use crate::git::{BranchLocks, GitError, DEFAULT_BASE_BRANCH};
use crate::models::{AgentConfiguration, AgentType, Job, JobId};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Runner was already started; each runner runs once")]
    AlreadyStarted,

    #[error("Agent backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to prepare job workspace: {0}")]
    Workspace(#[from] GitError),

    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),
}

/// Resource limits and image for containerized runs
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub docker_binary: PathBuf,
    pub image: String,
    pub memory: String,
    pub cpus: String,
    /// Host variable names passed through to the container
    pub env: Vec<String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            docker_binary: PathBuf::from("docker"),
            image: "agent-jobs/claude-agent:latest".to_string(),
            memory: "2g".to_string(),
            cpus: "2".to_string(),
            env: vec!["ANTHROPIC_API_KEY".to_string()],
        }
    }
}

/// Settings shared by every runner a factory creates
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub agent_binary: PathBuf,
    pub model: Option<String>,
    /// Bound of the runner -> orchestrator channel. A full channel blocks the runner.
    pub event_channel_capacity: usize,
    /// Time between the polite stop request and the forced kill
    pub stop_grace: Duration,
    /// Parent directory for job worktrees, system temp dir when unset
    pub workspace_root: Option<PathBuf>,
    pub partial_messages: bool,
    pub container: ContainerSettings,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            agent_binary: PathBuf::from("claude"),
            model: None,
            event_channel_capacity: 256,
            stop_grace: Duration::from_secs(10),
            workspace_root: None,
            partial_messages: true,
            container: ContainerSettings::default(),
        }
    }
}

/// Per-job facts a runner needs
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub system_prompt: Option<String>,
    pub locks: Arc<BranchLocks>,
}

/// A live run: the event stream plus the means to stop it.
///
/// The stream always ends with exactly one `Result` event. Dropping the run
/// cancels it.
pub struct AgentRun {
    events: mpsc::Receiver<AgentEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AgentRun {
    pub fn new(
        events: mpsc::Receiver<AgentEvent>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            cancel,
            task: Some(task),
        }
    }

    /// Next event, `None` once the runner has finished and released its resources
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Ask the runner to stop. Events already produced may still arrive,
    /// followed by a failed `Result`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the runner task has exited
    pub async fn finished(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("[AgentRun] Runner task failed: {}", e);
            }
        }
    }
}

impl Drop for AgentRun {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Executes one instruction and streams typed events.
///
/// Runners are single-use: a second `run` on the same instance fails with
/// [`RunnerError::AlreadyStarted`]. `run` must be called inside a Tokio runtime
/// and returns immediately; the work happens on a spawned task.
pub trait AgentRunner: Send + Sync {
    fn run(&self, instruction: &str) -> Result<AgentRun, RunnerError>;
}

/// Guard enforcing one run per runner instance
#[derive(Debug, Default)]
pub(crate) struct SingleUse(AtomicBool);

impl SingleUse {
    pub(crate) fn claim(&self) -> Result<(), RunnerError> {
        if self.0.swap(true, Ordering::SeqCst) {
            Err(RunnerError::AlreadyStarted)
        } else {
            Ok(())
        }
    }
}

/// Builds the runner for a job
pub trait RunnerFactory: Send + Sync {
    fn create(
        &self,
        job: &Job,
        config: &AgentConfiguration,
    ) -> Result<Box<dyn AgentRunner>, RunnerError>;
}

/// Picks [`ContainerRunner`] or [`SandboxRunner`] from the configuration's agent type
pub struct DefaultRunnerFactory {
    repo_path: PathBuf,
    base_branch: String,
    locks: Arc<BranchLocks>,
    settings: RunnerSettings,
}

impl DefaultRunnerFactory {
    pub fn new(repo_path: impl Into<PathBuf>, locks: Arc<BranchLocks>, settings: RunnerSettings) -> Self {
        Self {
            repo_path: repo_path.into(),
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            locks,
            settings,
        }
    }

    pub fn with_base_branch(mut self, base_branch: impl Into<String>) -> Self {
        self.base_branch = base_branch.into();
        self
    }
}

impl RunnerFactory for DefaultRunnerFactory {
    fn create(
        &self,
        job: &Job,
        config: &AgentConfiguration,
    ) -> Result<Box<dyn AgentRunner>, RunnerError> {
        let context = JobContext {
            job_id: job.id,
            repo_path: self.repo_path.clone(),
            base_branch: self.base_branch.clone(),
            system_prompt: config.compose_system_prompt(),
            locks: self.locks.clone(),
        };

        log::debug!(
            "[RunnerFactory] Job {} uses '{}' ({})",
            job.id,
            config.name,
            config.agent_type
        );

        match config.agent_type {
            AgentType::Docker => Ok(Box::new(ContainerRunner::new(
                context,
                self.settings.clone(),
            )?)),
            AgentType::FileSystem => Ok(Box::new(SandboxRunner::new(
                context,
                self.settings.clone(),
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_use_claims_once() {
        let guard = SingleUse::default();
        assert!(guard.claim().is_ok());
        assert!(matches!(guard.claim(), Err(RunnerError::AlreadyStarted)));
        assert!(matches!(guard.claim(), Err(RunnerError::AlreadyStarted)));
    }

    #[test]
    fn test_missing_binaries_are_unavailable() {
        let settings = RunnerSettings {
            agent_binary: PathBuf::from("/nonexistent/claude"),
            container: ContainerSettings {
                docker_binary: PathBuf::from("/nonexistent/docker"),
                ..ContainerSettings::default()
            },
            ..RunnerSettings::default()
        };
        let factory = DefaultRunnerFactory::new("/repo", Arc::new(BranchLocks::new()), settings);
        let job = Job::new(1, "do things");

        for agent_type in [AgentType::Docker, AgentType::FileSystem] {
            let config = AgentConfiguration::new("cfg", agent_type);
            assert!(matches!(
                factory.create(&job, &config),
                Err(RunnerError::Unavailable(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_dropping_run_cancels_token() {
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let run = AgentRun::new(rx, cancel.clone(), tokio::spawn(async {}));
        assert!(!cancel.is_cancelled());
        drop(run);
        assert!(cancel.is_cancelled());
    }
}
