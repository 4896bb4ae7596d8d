// Host filesystem runner (agent type FILE_SYSTEM)
//
// Runs the agent CLI directly with the job worktree as its working directory.

use std::path::PathBuf;
use tokio::process::Command;

use super::path_resolver::CliPathResolver;
use super::process::{claude_args, launch, ProcessSpec, StopMode};
use super::runner::{AgentRun, AgentRunner, JobContext, RunnerError, RunnerSettings, SingleUse};

pub struct SandboxRunner {
    context: JobContext,
    settings: RunnerSettings,
    agent_binary: PathBuf,
    started: SingleUse,
}

impl SandboxRunner {
    /// Fails with [`RunnerError::Unavailable`] when the agent CLI cannot be found
    pub fn new(context: JobContext, settings: RunnerSettings) -> Result<Self, RunnerError> {
        let agent_binary =
            CliPathResolver::resolve_claude(&settings.agent_binary).ok_or_else(|| {
                RunnerError::Unavailable(format!(
                    "agent CLI '{}' not found. Install: npm install -g @anthropic-ai/claude-code",
                    settings.agent_binary.display()
                ))
            })?;

        Ok(Self {
            context,
            settings,
            agent_binary,
            started: SingleUse::default(),
        })
    }
}

impl AgentRunner for SandboxRunner {
    fn run(&self, instruction: &str) -> Result<AgentRun, RunnerError> {
        self.started.claim()?;

        let agent_binary = self.agent_binary.clone();
        let args = claude_args(
            instruction,
            self.context.system_prompt.as_deref(),
            self.settings.model.as_deref(),
            self.settings.partial_messages,
        );

        log::info!(
            "[SandboxRunner] Starting job {} with {:?}",
            self.context.job_id,
            agent_binary
        );

        Ok(launch(
            self.context.clone(),
            &self.settings,
            "SandboxRunner",
            move |worktree| {
                let mut command = Command::new(&agent_binary);
                command.args(&args).current_dir(worktree);
                ProcessSpec {
                    command,
                    stop: StopMode::Signal,
                }
            },
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agents::AgentEvent;
    use crate::git::{job_branch_name, BranchLocks};
    use git2::{Repository, RepositoryInitOptions, Signature};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn init_repo(path: &Path) {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path, &opts).unwrap();
        std::fs::write(path.join("README.md"), "fixture\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
    }

    /// Stand-in agent: writes a file into its cwd and prints a stream-json transcript
    fn fake_agent(dir: &Path) -> PathBuf {
        let script = dir.join("fake-claude");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "echo 'generated' > output.txt\n",
                "echo '{\"type\":\"stream_event\",\"event\":{\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Writing\"}}}'\n",
                "echo '{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"result\":\"Wrote output.txt\"}'\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn test_run_streams_commits_and_releases() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path());
        let bin_dir = TempDir::new().unwrap();
        let workspace_root = TempDir::new().unwrap();

        let settings = RunnerSettings {
            agent_binary: fake_agent(bin_dir.path()),
            workspace_root: Some(workspace_root.path().to_path_buf()),
            ..RunnerSettings::default()
        };
        let context = JobContext {
            job_id: 5,
            repo_path: repo_dir.path().to_path_buf(),
            base_branch: "main".to_string(),
            system_prompt: None,
            locks: Arc::new(BranchLocks::new()),
        };

        let runner = SandboxRunner::new(context, settings).unwrap();
        let mut run = runner.run("write a file").unwrap();

        let mut events = Vec::new();
        while let Some(event) = run.next_event().await {
            events.push(event);
        }
        run.finished().await;

        assert_eq!(
            events,
            vec![
                AgentEvent::text("Writing"),
                AgentEvent::success("Wrote output.txt")
            ]
        );

        // The file landed on the job branch
        let repo = Repository::open(repo_dir.path()).unwrap();
        let branch = repo
            .find_branch(&job_branch_name(5), git2::BranchType::Local)
            .unwrap();
        let tree = branch.get().peel_to_commit().unwrap().tree().unwrap();
        assert!(tree.get_name("output.txt").is_some());

        // No worktree left behind
        assert_eq!(std::fs::read_dir(workspace_root.path()).unwrap().count(), 0);

        // Single use
        assert!(matches!(
            runner.run("again"),
            Err(RunnerError::AlreadyStarted)
        ));
    }
}
