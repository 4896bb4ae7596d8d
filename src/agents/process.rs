// Shared process driver for both runner variants
//
// One run: prepare the job worktree, spawn the agent, stream parsed events to
// the consumer, stop the process on cancel (polite stop, then kill after the
// grace period), commit the worktree under the branch write lock, release the
// worktree, and only then emit the single terminal Result.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::AgentEvent;
use super::format_parsers::ClaudeStreamParser;
use super::runner::{AgentRun, JobContext, RunnerError, RunnerSettings};
use crate::git::{job_branch_name, JobWorkspace};
use crate::utils::ellipsize;

/// Lines of stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for stderr to close after the process is gone
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How the process is asked to stop before it is killed
pub(crate) enum StopMode {
    /// SIGTERM to the child (plain kill elsewhere)
    Signal,
    /// `docker stop` on the named container, `docker kill` when forced
    Container {
        docker_binary: std::path::PathBuf,
        name: String,
    },
}

pub(crate) struct ProcessSpec {
    pub command: Command,
    pub stop: StopMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    ConsumerGone,
}

#[derive(Default)]
struct ProcessOutcome {
    result: Option<AgentEvent>,
    stop: Option<StopReason>,
    exit: Option<ExitStatus>,
    error: Option<String>,
    stderr_tail: String,
}

impl ProcessOutcome {
    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// The one terminal event for this run
    fn into_result(self) -> AgentEvent {
        let mut result = match (self.stop, self.error, self.result) {
            (Some(StopReason::Cancelled), _, _) => AgentEvent::Result {
                ok: false,
                summary: "Run cancelled".to_string(),
                errors: vec!["Run was cancelled before completion".to_string()],
            },
            (Some(StopReason::ConsumerGone), _, _) => {
                AgentEvent::failure("Event consumer disconnected")
            }
            (None, Some(error), _) => AgentEvent::failure(error),
            (None, None, Some(result)) => return result,
            (None, None, None) => AgentEvent::failure(match self.exit {
                Some(status) => format!("Agent exited without a result ({})", status),
                None => "Agent exited without a result".to_string(),
            }),
        };

        if !self.stderr_tail.is_empty() {
            if let AgentEvent::Result { errors, .. } = &mut result {
                errors.push(self.stderr_tail);
            }
        }
        result
    }
}

/// Start a run on a spawned task and hand back its event stream
pub(crate) fn launch<F>(
    context: JobContext,
    settings: &RunnerSettings,
    label: &'static str,
    build: F,
) -> AgentRun
where
    F: FnOnce(&Path) -> ProcessSpec + Send + 'static,
{
    let (tx, rx) = mpsc::channel(settings.event_channel_capacity.max(1));
    let cancel = CancellationToken::new();

    let parser = if settings.partial_messages {
        ClaudeStreamParser::partial()
    } else {
        ClaudeStreamParser::complete_messages()
    };
    let driver = Driver {
        context,
        label,
        parser,
        grace: settings.stop_grace,
        workspace_root: settings.workspace_root.clone(),
    };

    let task = tokio::spawn(driver.drive(build, tx, cancel.clone()));
    AgentRun::new(rx, cancel, task)
}

struct Driver {
    context: JobContext,
    label: &'static str,
    parser: ClaudeStreamParser,
    grace: Duration,
    workspace_root: Option<std::path::PathBuf>,
}

impl Driver {
    async fn drive<F>(self, build: F, tx: mpsc::Sender<AgentEvent>, cancel: CancellationToken)
    where
        F: FnOnce(&Path) -> ProcessSpec,
    {
        let job_id = self.context.job_id;
        let result = self.execute(build, &tx, &cancel).await;

        if let AgentEvent::Result { ok, summary, .. } = &result {
            log::info!(
                "[{}] Job {} finished (ok={}): {}",
                self.label,
                job_id,
                ok,
                ellipsize(summary, 200)
            );
        }

        if tx.send(result).await.is_err() {
            log::debug!("[{}] Job {} result had no receiver", self.label, job_id);
        }
    }

    async fn execute<F>(
        &self,
        build: F,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> AgentEvent
    where
        F: FnOnce(&Path) -> ProcessSpec,
    {
        let branch = job_branch_name(self.context.job_id);

        let workspace = match JobWorkspace::prepare(
            &self.context.repo_path,
            &branch,
            &self.context.base_branch,
            self.workspace_root.as_deref(),
        )
        .await
        {
            Ok(workspace) => workspace,
            Err(e) => return AgentEvent::failure(RunnerError::Workspace(e).to_string()),
        };

        let spec = build(workspace.path());
        let outcome = run_process(spec, self.parser, tx, cancel, self.grace).await;
        let mut result = outcome.into_result();

        // Commit whatever the agent left behind, even on failure, so a resumed
        // run starts from it
        {
            let _guard = self.context.locks.write(&branch).await;
            let message = commit_message(&branch, &result);
            match workspace.commit_all(&message).await {
                Ok(Some(commit)) => {
                    log::info!("[{}] Committed {} on {}", self.label, commit, branch)
                }
                Ok(None) => log::debug!("[{}] Nothing to commit on {}", self.label, branch),
                Err(e) => {
                    log::warn!("[{}] Commit on {} failed: {}", self.label, branch, e);
                    if let AgentEvent::Result { ok, errors, .. } = &mut result {
                        *ok = false;
                        errors.push(format!("Failed to commit changes: {}", e));
                    }
                }
            }
        }

        if let Err(e) = workspace.release().await {
            log::warn!("[{}] Failed to release worktree for {}: {}", self.label, branch, e);
        }

        result
    }
}

fn commit_message(branch: &str, result: &AgentEvent) -> String {
    let summary = match result {
        AgentEvent::Result { summary, .. } => summary.lines().next().unwrap_or("").trim(),
        _ => "",
    };
    if summary.is_empty() {
        format!("{}: agent changes", branch)
    } else {
        format!("{}: {}", branch, ellipsize(summary, 72))
    }
}

async fn run_process(
    spec: ProcessSpec,
    parser: ClaudeStreamParser,
    tx: &mpsc::Sender<AgentEvent>,
    cancel: &CancellationToken,
    grace: Duration,
) -> ProcessOutcome {
    let ProcessSpec { mut command, stop } = spec;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return ProcessOutcome::failed(RunnerError::Spawn(e.to_string()).to_string()),
    };

    let stderr_task = child.stderr.take().map(|s| tokio::spawn(collect_tail(s)));
    let Some(stdout) = child.stdout.take() else {
        stop_child(&mut child, &stop, grace).await;
        return ProcessOutcome::failed("Failed to capture agent stdout".to_string());
    };

    let mut outcome = ProcessOutcome::default();
    let mut lines = BufReader::new(stdout).lines();

    'read: loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome.stop = Some(StopReason::Cancelled);
                break;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                for event in parser.parse_line(&line) {
                    if event.is_result() {
                        // Held back until commit and cleanup are done
                        if outcome.result.is_none() {
                            outcome.result = Some(event);
                        }
                        continue;
                    }

                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            outcome.stop = Some(StopReason::Cancelled);
                            break 'read;
                        }
                        sent = tx.send(event) => sent,
                    };
                    if sent.is_err() {
                        outcome.stop = Some(StopReason::ConsumerGone);
                        break 'read;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                outcome.error = Some(format!("Failed to read agent output: {}", e));
                break;
            }
        }
    }

    if outcome.stop.is_none() && outcome.error.is_none() {
        // stdout closed; the process should be exiting on its own
        let mut cancelled = false;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => cancelled = true,
            status = child.wait() => outcome.exit = status.ok(),
        }
        if cancelled {
            outcome.stop = Some(StopReason::Cancelled);
        }
    }
    if outcome.exit.is_none() {
        outcome.exit = stop_child(&mut child, &stop, grace).await;
    }

    if let Some(task) = stderr_task {
        if let Ok(Ok(tail)) = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
            outcome.stderr_tail = tail;
        }
    }

    outcome
}

/// Keep the last few stderr lines
async fn collect_tail<R: AsyncRead + Unpin>(stderr: R) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n").trim().to_string()
}

/// Ask politely, wait out the grace period, then force
async fn stop_child(child: &mut Child, stop: &StopMode, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    let stop_request = match stop {
        StopMode::Signal => {
            request_terminate(child).await;
            None
        }
        StopMode::Container {
            docker_binary,
            name,
        } => {
            let mut cmd = Command::new(docker_binary);
            cmd.arg("stop")
                .arg("-t")
                .arg(grace.as_secs().to_string())
                .arg(name)
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            // docker stop blocks for up to the grace period itself
            Some(tokio::spawn(async move { cmd.status().await }))
        }
    };

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => {
            log::warn!(
                "[AgentProcess] Process did not stop within {:?}, killing",
                grace
            );
            if let StopMode::Container {
                docker_binary,
                name,
            } = stop
            {
                let _ = Command::new(docker_binary)
                    .arg("kill")
                    .arg(name)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
            if let Err(e) = child.kill().await {
                log::warn!("[AgentProcess] Kill failed: {}", e);
            }
            child.wait().await.ok()
        }
    };

    if let Some(task) = stop_request {
        task.abort();
    }
    status
}

#[cfg(unix)]
async fn request_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .arg("-15")
            .arg(pid.to_string())
            .status()
            .await;
    }
}

#[cfg(not(unix))]
async fn request_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// Arguments for a headless Claude CLI run that streams JSON to stdout
pub(crate) fn claude_args(
    instruction: &str,
    system_prompt: Option<&str>,
    model: Option<&str>,
    partial_messages: bool,
) -> Vec<String> {
    let mut args: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if partial_messages {
        args.push("--include-partial-messages".to_string());
    }
    args.push("--dangerously-skip-permissions".to_string());
    if let Some(prompt) = system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.to_string());
    }
    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    // The prompt is positional; `--` keeps a leading dash from reading as a flag
    args.push("--".to_string());
    args.push(instruction.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_args_shape() {
        let args = claude_args("fix the bug", Some("be careful"), Some("sonnet"), true);
        assert_eq!(args[0], "--print");
        assert!(args.contains(&"--include-partial-messages".to_string()));
        let sp = args.iter().position(|a| a == "--append-system-prompt").unwrap();
        assert_eq!(args[sp + 1], "be careful");
        let model = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model + 1], "sonnet");
        assert_eq!(args.last().unwrap(), "fix the bug");

        let bare = claude_args("-x looks like a flag", None, None, false);
        assert!(!bare.contains(&"--include-partial-messages".to_string()));
        assert!(!bare.contains(&"--model".to_string()));
        assert_eq!(&bare[bare.len() - 2..], ["--", "-x looks like a flag"]);
    }

    #[test]
    fn test_missing_result_is_failure() {
        let outcome = ProcessOutcome {
            stderr_tail: "Error: not logged in".to_string(),
            ..Default::default()
        };
        match outcome.into_result() {
            AgentEvent::Result { ok, errors, .. } => {
                assert!(!ok);
                assert!(errors[0].contains("without a result"));
                assert_eq!(errors[1], "Error: not logged in");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cancel_overrides_held_result() {
        let outcome = ProcessOutcome {
            result: Some(AgentEvent::success("done")),
            stop: Some(StopReason::Cancelled),
            ..Default::default()
        };
        assert!(matches!(
            outcome.into_result(),
            AgentEvent::Result { ok: false, .. }
        ));
    }

    #[test]
    fn test_held_result_passes_through() {
        let outcome = ProcessOutcome {
            result: Some(AgentEvent::success("done")),
            stderr_tail: "noise".to_string(),
            ..Default::default()
        };
        assert_eq!(outcome.into_result(), AgentEvent::success("done"));
    }

    #[test]
    fn test_commit_message_uses_first_summary_line() {
        let msg = commit_message("agent-job-3", &AgentEvent::success("Added tests\nand more"));
        assert_eq!(msg, "agent-job-3: Added tests");
        let msg = commit_message("agent-job-3", &AgentEvent::success(""));
        assert_eq!(msg, "agent-job-3: agent changes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_streams_events_and_holds_result() {
        let script = concat!(
            "echo '{\"type\":\"system\",\"subtype\":\"init\"}'; ",
            "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}'; ",
            "echo '{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"result\":\"done\"}'"
        );
        let mut command = Command::new("sh");
        command.args(["-c", script]);

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let outcome = run_process(
            ProcessSpec {
                command,
                stop: StopMode::Signal,
            },
            ClaudeStreamParser::complete_messages(),
            &tx,
            &cancel,
            Duration::from_secs(1),
        )
        .await;
        drop(tx);

        assert_eq!(rx.recv().await, Some(AgentEvent::text("hi")));
        assert_eq!(rx.recv().await, None);
        assert_eq!(outcome.result, Some(AgentEvent::success("done")));
        assert!(outcome.exit.map(|s| s.success()).unwrap_or(false));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_process_that_ignores_sigterm() {
        let mut command = Command::new("sh");
        command.args(["-c", "trap '' TERM; while true; do sleep 1; done"]);

        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = run_process(
            ProcessSpec {
                command,
                stop: StopMode::Signal,
            },
            ClaudeStreamParser::partial(),
            &tx,
            &cancel,
            Duration::from_millis(300),
        )
        .await;

        assert_eq!(outcome.stop, Some(StopReason::Cancelled));
        assert!(outcome.exit.is_some(), "process must be reaped");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let (tx, _rx) = mpsc::channel(1);
        let outcome = run_process(
            ProcessSpec {
                command: Command::new("/nonexistent/agent-binary"),
                stop: StopMode::Signal,
            },
            ClaudeStreamParser::partial(),
            &tx,
            &CancellationToken::new(),
            Duration::from_millis(100),
        )
        .await;
        match outcome.into_result() {
            AgentEvent::Result { ok, summary, .. } => {
                assert!(!ok);
                assert!(summary.contains("spawn"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
