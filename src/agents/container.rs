// Containerized runner (agent type DOCKER)
//
// The job worktree is bind-mounted at /workspace inside a throwaway container
// (`--rm`) with memory and CPU limits. Stopping goes through `docker stop` and
// `docker kill` on the container name rather than signalling the client.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use uuid::Uuid;

use super::path_resolver::CliPathResolver;
use super::process::{claude_args, launch, ProcessSpec, StopMode};
use super::runner::{
    AgentRun, AgentRunner, ContainerSettings, JobContext, RunnerError, RunnerSettings, SingleUse,
};
use crate::models::JobId;

/// Mount point of the worktree inside the container
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Agent command inside the image
const CONTAINER_AGENT_COMMAND: &str = "claude";

pub struct ContainerRunner {
    context: JobContext,
    settings: RunnerSettings,
    docker_binary: PathBuf,
    started: SingleUse,
}

impl ContainerRunner {
    /// Fails with [`RunnerError::Unavailable`] when no docker binary can be found
    pub fn new(context: JobContext, settings: RunnerSettings) -> Result<Self, RunnerError> {
        let docker_binary = CliPathResolver::resolve_docker(&settings.container.docker_binary)
            .ok_or_else(|| {
                RunnerError::Unavailable(format!(
                    "docker binary '{}' not found",
                    settings.container.docker_binary.display()
                ))
            })?;

        Ok(Self {
            context,
            settings,
            docker_binary,
            started: SingleUse::default(),
        })
    }
}

impl AgentRunner for ContainerRunner {
    fn run(&self, instruction: &str) -> Result<AgentRun, RunnerError> {
        self.started.claim()?;

        let job_id = self.context.job_id;
        let name = container_name(job_id);
        let docker_binary = self.docker_binary.clone();
        let container = self.settings.container.clone();
        let agent_args = claude_args(
            instruction,
            self.context.system_prompt.as_deref(),
            self.settings.model.as_deref(),
            self.settings.partial_messages,
        );

        log::info!(
            "[ContainerRunner] Starting job {} in container {} ({})",
            job_id,
            name,
            container.image
        );

        Ok(launch(
            self.context.clone(),
            &self.settings,
            "ContainerRunner",
            move |worktree| {
                let mut command = Command::new(&docker_binary);
                command.args(docker_run_args(
                    &name,
                    worktree,
                    host_user(worktree).as_deref(),
                    &container,
                    &agent_args,
                ));
                ProcessSpec {
                    command,
                    stop: StopMode::Container {
                        docker_binary,
                        name,
                    },
                }
            },
        ))
    }
}

/// Unique per run so a resumed job never collides with a container still being torn down
fn container_name(job_id: JobId) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("agent-job-{}-{}", job_id, &suffix[..8])
}

/// Run as the worktree owner so files written in the container stay committable on the host
#[cfg(unix)]
fn host_user(worktree: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(worktree)
        .ok()
        .map(|m| format!("{}:{}", m.uid(), m.gid()))
}

#[cfg(not(unix))]
fn host_user(_worktree: &Path) -> Option<String> {
    None
}

fn docker_run_args(
    name: &str,
    worktree: &Path,
    user: Option<&str>,
    container: &ContainerSettings,
    agent_args: &[String],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-v".to_string(),
        format!("{}:{}", worktree.display(), CONTAINER_WORKSPACE),
        "-w".to_string(),
        CONTAINER_WORKSPACE.to_string(),
        format!("--memory={}", container.memory),
        format!("--cpus={}", container.cpus),
    ];

    if let Some(user) = user {
        args.push("--user".to_string());
        args.push(user.to_string());
        // The mapped user has no home in the image
        args.push("-e".to_string());
        args.push("HOME=/tmp".to_string());
    }

    // Bare names: docker copies the value from the host environment
    for var in &container.env {
        args.push("-e".to_string());
        args.push(var.clone());
    }

    args.push(container.image.clone());
    args.push(CONTAINER_AGENT_COMMAND.to_string());
    args.extend(agent_args.iter().cloned());
    args
}
