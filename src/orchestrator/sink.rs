// Per-run event sink
//
// Drains one AgentRun in order, applies each event to the job and forwards it
// to the broadcaster. Events from a run that is no longer the job's live run
// (cancelled, timed out, waiting for the user) are dropped.

use std::sync::Arc;
use std::time::Duration;

use super::{Inner, JobEntry};
use crate::agents::{AgentEvent, AgentRun};
use crate::models::{JobId, JobStatus};
use crate::utils::{ellipsize, lock_mutex_recover};

/// Unterminated text longer than this is logged as its own line
const MAX_PENDING_TEXT: usize = 4096;

pub(super) async fn drive(inner: Arc<Inner>, job_id: JobId, run_id: u64, mut run: AgentRun) {
    let mut window = inner
        .settings
        .inactivity_timeout
        .filter(|window| !window.is_zero());

    loop {
        let next = match window {
            Some(limit) => match tokio::time::timeout(limit, run.next_event()).await {
                Ok(next) => next,
                Err(_) => {
                    inner.time_out(job_id, run_id, limit);
                    run.cancel();
                    // Keep draining until the runner has cleaned up
                    window = None;
                    continue;
                }
            },
            None => run.next_event().await,
        };

        let Some(event) = next else { break };
        if inner.apply(job_id, run_id, event) {
            run.cancel();
        }
    }

    run.finished().await;
    inner.end_run(job_id, run_id);
}

impl Inner {
    /// Apply one event. Returns true when the run should be stopped.
    fn apply(&self, job_id: JobId, run_id: u64, event: AgentEvent) -> bool {
        let mut jobs = lock_mutex_recover(&self.jobs);
        let Some(entry) = jobs.get_mut(&job_id) else {
            return false;
        };
        if entry.live_run != Some(run_id) {
            log::trace!("[JobOrchestrator] Dropping event from stale run of job {}", job_id);
            return false;
        }

        match &event {
            AgentEvent::TextDelta { text: delta } => {
                for line in entry.text.push(delta) {
                    self.log(entry, line);
                }
                self.broadcaster.publish(job_id, event);
                false
            }
            AgentEvent::ToolUseStarted { name } => {
                self.flush_text(entry);
                self.log(entry, format!("Tool started: {}", name));
                self.broadcaster.publish(job_id, event);
                false
            }
            AgentEvent::ToolUseCompleted { name, input } => {
                self.flush_text(entry);
                self.log(
                    entry,
                    format!("Tool call: {} {}", name, ellipsize(&input.to_string(), 300)),
                );
                let question = event.ask_user_question();
                self.broadcaster.publish(job_id, event);

                match question {
                    Some(question) => {
                        self.wait_for_user(entry, question);
                        true
                    }
                    None => false,
                }
            }
            AgentEvent::Result {
                ok,
                summary,
                errors,
            } => {
                let (status, message) = if *ok {
                    (JobStatus::Completed, format!("Completed: {}", summary))
                } else if errors.is_empty() {
                    (JobStatus::Failed, format!("Failed: {}", summary))
                } else {
                    (JobStatus::Failed, format!("Failed: {}", errors.join("; ")))
                };
                self.finish(entry, status, message, event);
                false
            }
        }
    }

    /// Log whatever text the live run streamed without a trailing newline
    pub(super) fn flush_text(&self, entry: &mut JobEntry) {
        if let Some(line) = entry.text.flush() {
            self.log(entry, line);
        }
    }

    fn wait_for_user(&self, entry: &mut JobEntry, question: String) {
        if let Err(e) = self.set_status(entry, JobStatus::WaitingForUser) {
            log::warn!(
                "[JobOrchestrator] Job {} cannot wait for user: {}",
                entry.job.id,
                e
            );
            return;
        }
        self.log(entry, format!("Waiting for user: {}", question));
        entry.pending_question = Some(question);
        entry.live_run = None;
    }

    fn time_out(&self, job_id: JobId, run_id: u64, window: Duration) {
        let mut jobs = lock_mutex_recover(&self.jobs);
        let Some(entry) = jobs.get_mut(&job_id) else {
            return;
        };
        if entry.live_run != Some(run_id) {
            return;
        }

        let message = format!("No agent activity for {:?}, stopping", window);
        log::warn!("[JobOrchestrator] Job {}: {}", job_id, message);
        self.finish(
            entry,
            JobStatus::Failed,
            message.clone(),
            AgentEvent::Result {
                ok: false,
                summary: "Timed out".to_string(),
                errors: vec![message],
            },
        );
    }

    /// The run's task is done and its resources are released
    fn end_run(&self, job_id: JobId, run_id: u64) {
        let mut jobs = lock_mutex_recover(&self.jobs);
        let Some(entry) = jobs.get_mut(&job_id) else {
            return;
        };

        // Only a runner that broke its contract ends without a Result
        if entry.live_run == Some(run_id) {
            let message = "Agent stream ended without a result".to_string();
            self.finish(
                entry,
                JobStatus::Failed,
                message.clone(),
                AgentEvent::failure(message),
            );
        }

        if entry.active.as_ref().map(|active| active.run_id) == Some(run_id) {
            entry.active = None;
        }
    }
}

/// Joins streamed text deltas into whole log lines
#[derive(Default)]
pub(super) struct TextBuffer {
    pending: String,
}

impl TextBuffer {
    fn push(&mut self, delta: &str) -> Vec<String> {
        self.pending.push_str(delta);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end();
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.pending.len() > MAX_PENDING_TEXT {
            if let Some(line) = self.flush() {
                lines.push(line);
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_buffer_joins_deltas_into_lines() {
        let mut buffer = TextBuffer::default();
        assert!(buffer.push("Hel").is_empty());
        assert_eq!(buffer.push("lo\nWor"), vec!["Hello"]);
        assert_eq!(buffer.push("ld\n\n  \nnext"), vec!["World"]);
        assert_eq!(buffer.flush().as_deref(), Some("next"));
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn test_text_buffer_caps_unterminated_text() {
        let mut buffer = TextBuffer::default();
        let lines = buffer.push(&"x".repeat(MAX_PENDING_TEXT + 1));
        assert_eq!(lines.len(), 1);
        assert_eq!(buffer.flush(), None);
    }
}
