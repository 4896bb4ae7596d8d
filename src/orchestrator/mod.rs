//! Job lifecycle orchestration
//!
//! `JobOrchestrator` owns every tracked job's state machine. Starting a job
//! builds a runner for its configuration and spawns a sink task that applies
//! the runner's events to the job, forwards them to the `EventBroadcaster`,
//! and performs the terminal transition. The jobs map is only ever locked
//! briefly and never across an await.

mod mutations;
mod sink;

pub use mutations::JobMutation;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentEvent, AgentRun, RunnerError, RunnerFactory};
use crate::events::{EventBroadcaster, EventFeed};
use crate::git::{ConflictDetector, ConflictError, ConflictReport, GitError};
use crate::models::state_machine::{is_active_state, StateTransitionError};
use crate::models::{AgentConfiguration, Artifact, Job, JobId, JobStatus, LogEntry};
use crate::shutdown::ShutdownResult;
use crate::utils::{ellipsize, lock_mutex_recover};

/// Log lines carried into a resumed run
const RESUME_LOG_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Cannot {operation} job {job_id}: it is {actual}, expected {expected}")]
    InvalidState {
        job_id: JobId,
        operation: &'static str,
        actual: JobStatus,
        expected: &'static str,
    },

    #[error("Unknown job {0}")]
    UnknownJob(JobId),

    #[error("Job {0} still has a live agent run")]
    JobActive(JobId),
}

impl OrchestratorError {
    fn invalid_state(
        job_id: JobId,
        operation: &'static str,
        actual: JobStatus,
        expected: &'static str,
    ) -> Self {
        OrchestratorError::InvalidState {
            job_id,
            operation,
            actual,
            expected,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    /// Fail a running job after this long without an event. `None` disables it.
    pub inactivity_timeout: Option<Duration>,
}

/// Flips to true once a run's sink task has exited. Every waiter holds a clone.
type RunDone = watch::Receiver<bool>;

struct ActiveRun {
    run_id: u64,
    cancel: CancellationToken,
    done: RunDone,
}

struct JobEntry {
    job: Job,
    config: AgentConfiguration,
    /// Run whose events are applied to the job; `None` while waiting or terminal
    live_run: Option<u64>,
    /// Run whose sink task has not exited yet
    active: Option<ActiveRun>,
    pending_question: Option<String>,
    /// Unterminated text streamed by the live run
    text: sink::TextBuffer,
}

impl JobEntry {
    fn new(job: Job, config: AgentConfiguration) -> Self {
        Self {
            job,
            config,
            live_run: None,
            active: None,
            pending_question: None,
            text: sink::TextBuffer::default(),
        }
    }
}

struct Inner {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    factory: Arc<dyn RunnerFactory>,
    broadcaster: Arc<EventBroadcaster>,
    detector: Arc<ConflictDetector>,
    settings: OrchestratorSettings,
    mutations: Mutex<Option<mpsc::UnboundedSender<JobMutation>>>,
    next_run_id: AtomicU64,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        factory: Arc<dyn RunnerFactory>,
        broadcaster: Arc<EventBroadcaster>,
        detector: Arc<ConflictDetector>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                factory,
                broadcaster,
                detector,
                settings,
                mutations: Mutex::new(None),
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    /// Receive every status, log and artifact mutation from now on.
    /// A new subscription replaces the previous one.
    pub fn subscribe_mutations(&self) -> mpsc::UnboundedReceiver<JobMutation> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock_mutex_recover(&self.inner.mutations) = Some(tx);
        rx
    }

    /// Start a PENDING job. Returns the job's status afterwards: RUNNING, or
    /// FAILED when no runner could be started (recorded in the job's logs).
    pub fn start(&self, job: Job, config: AgentConfiguration) -> Result<JobStatus, OrchestratorError> {
        let job_id = job.id;
        if job.status != JobStatus::Pending {
            return Err(OrchestratorError::invalid_state(
                job_id, "start", job.status, "PENDING",
            ));
        }
        self.ensure_untracked(job_id)?;

        let launched = self
            .inner
            .factory
            .create(&job, &config)
            .and_then(|runner| runner.run(&job.prompt));

        let mut jobs = lock_mutex_recover(&self.inner.jobs);
        // A concurrent start may have won; dropping `launched` cancels our run
        if let Some(existing) = jobs.get(&job_id) {
            return Err(OrchestratorError::invalid_state(
                job_id,
                "start",
                existing.job.status,
                "PENDING",
            ));
        }

        let mut entry = JobEntry::new(job, config);
        let status = match launched {
            Ok(run) => {
                let note = format!("Started agent on branch {}", entry.job.branch_name());
                self.inner.begin_run(&mut entry, run, note);
                entry.job.status
            }
            Err(e) => {
                self.inner.fail_to_launch(&mut entry, e);
                JobStatus::Failed
            }
        };
        jobs.insert(job_id, entry);
        Ok(status)
    }

    /// Stop a RUNNING or WAITING_FOR_USER job and mark it FAILED.
    ///
    /// Returns once the runner has stopped and released its resources.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), OrchestratorError> {
        let done = {
            let mut jobs = lock_mutex_recover(&self.inner.jobs);
            let entry = jobs
                .get_mut(&job_id)
                .ok_or(OrchestratorError::UnknownJob(job_id))?;

            let status = entry.job.status;
            if !is_active_state(status) {
                return Err(OrchestratorError::invalid_state(
                    job_id,
                    "cancel",
                    status,
                    "RUNNING or WAITING_FOR_USER",
                ));
            }

            self.inner.finish(
                entry,
                JobStatus::Failed,
                "Cancelled by user".to_string(),
                AgentEvent::Result {
                    ok: false,
                    summary: "Job cancelled".to_string(),
                    errors: vec!["Cancelled by user".to_string()],
                },
            );

            entry.active.as_ref().map(|active| {
                active.cancel.cancel();
                active.done.clone()
            })
        };

        if let Some(done) = done {
            wait_for_run(done).await;
        }
        Ok(())
    }

    /// Resume a WAITING_FOR_USER job with the human's reply.
    ///
    /// The stopped run is replaced by a fresh one on the same branch, seeded
    /// with the original prompt, recent logs, the question and the reply.
    pub async fn respond(&self, job_id: JobId, reply: &str) -> Result<JobStatus, OrchestratorError> {
        let prior = {
            let mut jobs = lock_mutex_recover(&self.inner.jobs);
            let entry = jobs
                .get_mut(&job_id)
                .ok_or(OrchestratorError::UnknownJob(job_id))?;
            Self::expect_waiting(entry)?;
            entry.active.as_ref().map(|active| active.done.clone())
        };

        // The stopped run must finish committing before the branch is reused
        if let Some(done) = prior {
            wait_for_run(done).await;
        }

        let (job, config, instruction) = {
            let jobs = lock_mutex_recover(&self.inner.jobs);
            let entry = jobs
                .get(&job_id)
                .ok_or(OrchestratorError::UnknownJob(job_id))?;
            Self::expect_waiting(entry)?;
            let question = entry.pending_question.clone().unwrap_or_default();
            let instruction = resume_instruction(&entry.job, &question, reply);
            (entry.job.clone(), entry.config.clone(), instruction)
        };

        let launched = self
            .inner
            .factory
            .create(&job, &config)
            .and_then(|runner| runner.run(&instruction));

        let mut jobs = lock_mutex_recover(&self.inner.jobs);
        let entry = jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::UnknownJob(job_id))?;
        // Cancelled while the runner was being built
        Self::expect_waiting(entry)?;

        match launched {
            Ok(run) => {
                entry.pending_question = None;
                let note = format!("User replied: {}", ellipsize(reply, 500));
                self.inner.begin_run(entry, run, note);
                Ok(entry.job.status)
            }
            Err(e) => {
                self.inner.fail_to_launch(entry, e);
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Append a log line. Allowed in every state and never changes status.
    pub fn append_log(
        &self,
        job_id: JobId,
        message: impl Into<String>,
    ) -> Result<LogEntry, OrchestratorError> {
        let mut jobs = lock_mutex_recover(&self.inner.jobs);
        let entry = jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::UnknownJob(job_id))?;
        Ok(self.inner.log(entry, message.into()))
    }

    /// Record a generated file. Allowed in every state and never changes status.
    pub fn add_artifact(
        &self,
        job_id: JobId,
        filename: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Artifact, OrchestratorError> {
        let mut jobs = lock_mutex_recover(&self.inner.jobs);
        let entry = jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::UnknownJob(job_id))?;
        let artifact = entry.job.add_artifact(filename, content);
        self.inner.emit(JobMutation::ArtifactAdded {
            job_id,
            artifact: artifact.clone(),
        });
        Ok(artifact)
    }

    /// Files touched by more than one of the given jobs. Read-only.
    pub async fn check_conflicts(&self, job_ids: &[JobId]) -> Result<ConflictReport, ConflictError> {
        self.inner.detector.check_conflicts(job_ids).await
    }

    /// Diff of a job's branch against the base branch
    pub async fn diff(&self, job_id: JobId) -> Result<String, GitError> {
        self.inner.detector.diff_for_job(job_id).await
    }

    /// Snapshot of a tracked job
    pub fn job(&self, job_id: JobId) -> Option<Job> {
        lock_mutex_recover(&self.inner.jobs)
            .get(&job_id)
            .map(|entry| entry.job.clone())
    }

    pub fn jobs(&self) -> Vec<Job> {
        let jobs = lock_mutex_recover(&self.inner.jobs);
        let mut all: Vec<Job> = jobs.values().map(|entry| entry.job.clone()).collect();
        all.sort_by_key(|job| job.id);
        all
    }

    /// The question a WAITING_FOR_USER job is blocked on
    pub fn pending_question(&self, job_id: JobId) -> Option<String> {
        lock_mutex_recover(&self.inner.jobs)
            .get(&job_id)
            .and_then(|entry| entry.pending_question.clone())
    }

    /// Live event feed for a tracked job
    pub fn attach(&self, job_id: JobId) -> Result<EventFeed, OrchestratorError> {
        if !lock_mutex_recover(&self.inner.jobs).contains_key(&job_id) {
            return Err(OrchestratorError::UnknownJob(job_id));
        }
        Ok(self.inner.broadcaster.attach(job_id))
    }

    /// Stop tracking a terminal job and hand back its final record
    pub fn release(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        let mut jobs = lock_mutex_recover(&self.inner.jobs);
        let entry = jobs
            .get(&job_id)
            .ok_or(OrchestratorError::UnknownJob(job_id))?;

        if !entry.job.is_terminal() || entry.active.is_some() {
            return Err(OrchestratorError::JobActive(job_id));
        }

        let entry = jobs
            .remove(&job_id)
            .ok_or(OrchestratorError::UnknownJob(job_id))?;
        self.inner.broadcaster.remove(job_id);
        Ok(entry.job)
    }

    /// Cancel every RUNNING or WAITING_FOR_USER job and wait for their runners
    pub async fn shutdown(&self) -> ShutdownResult {
        let mut ids: Vec<JobId> = lock_mutex_recover(&self.inner.jobs)
            .values()
            .filter(|entry| is_active_state(entry.job.status))
            .map(|entry| entry.job.id)
            .collect();
        ids.sort_unstable();

        log::info!("[JobOrchestrator] Shutting down {} active jobs", ids.len());

        let outcomes =
            futures_util::future::join_all(ids.iter().map(|&id| self.cancel(id))).await;

        let mut result = ShutdownResult::new();
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => result.jobs_cancelled.push(id),
                Err(e) => result.errors.push(format!("Job {}: {}", id, e)),
            }
        }
        result
    }

    fn ensure_untracked(&self, job_id: JobId) -> Result<(), OrchestratorError> {
        match lock_mutex_recover(&self.inner.jobs).get(&job_id) {
            Some(existing) => Err(OrchestratorError::invalid_state(
                job_id,
                "start",
                existing.job.status,
                "PENDING",
            )),
            None => Ok(()),
        }
    }

    fn expect_waiting(entry: &JobEntry) -> Result<(), OrchestratorError> {
        match entry.job.status {
            JobStatus::WaitingForUser => Ok(()),
            other => Err(OrchestratorError::invalid_state(
                entry.job.id,
                "respond to",
                other,
                "WAITING_FOR_USER",
            )),
        }
    }
}

impl Inner {
    fn emit(&self, mutation: JobMutation) {
        let mut guard = lock_mutex_recover(&self.mutations);
        if let Some(tx) = guard.as_ref() {
            if tx.send(mutation).is_err() {
                log::debug!("[JobOrchestrator] Mutation subscriber went away");
                *guard = None;
            }
        }
    }

    fn set_status(&self, entry: &mut JobEntry, to: JobStatus) -> Result<(), StateTransitionError> {
        let from = entry.job.transition_to(to)?;
        log::info!("[JobOrchestrator] Job {}: {} -> {}", entry.job.id, from, to);
        self.emit(JobMutation::StatusChanged {
            job_id: entry.job.id,
            from,
            to,
            at: entry.job.updated_at,
        });
        Ok(())
    }

    fn log(&self, entry: &mut JobEntry, message: String) -> LogEntry {
        let log_entry = entry.job.append_log(message);
        self.emit(JobMutation::LogAppended {
            job_id: entry.job.id,
            entry: log_entry.clone(),
        });
        log_entry
    }

    /// Terminal transition: record it, publish the final event, end every feed
    fn finish(&self, entry: &mut JobEntry, status: JobStatus, message: String, event: AgentEvent) {
        if let Err(e) = self.set_status(entry, status) {
            log::warn!(
                "[JobOrchestrator] Job {} not moved to {}: {}",
                entry.job.id,
                status,
                e
            );
            return;
        }
        self.flush_text(entry);
        self.log(entry, message);
        entry.live_run = None;
        entry.pending_question = None;

        self.broadcaster.publish(entry.job.id, event);
        self.broadcaster.close(entry.job.id);
    }

    /// Move the job to RUNNING and spawn the sink for `run`
    fn begin_run(self: &Arc<Self>, entry: &mut JobEntry, run: AgentRun, note: String) {
        if let Err(e) = self.set_status(entry, JobStatus::Running) {
            log::error!(
                "[JobOrchestrator] Job {} cannot run: {}",
                entry.job.id,
                e
            );
            return;
        }
        self.log(entry, note);

        let job_id = entry.job.id;
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let cancel = run.cancel_token();
        let (done_tx, done) = watch::channel(false);
        let drive = sink::drive(self.clone(), job_id, run_id, run);
        tokio::spawn(async move {
            drive.await;
            let _ = done_tx.send(true);
        });

        entry.live_run = Some(run_id);
        entry.text = sink::TextBuffer::default();
        entry.active = Some(ActiveRun {
            run_id,
            cancel,
            done,
        });
    }

    /// Runner construction failed: the job fails instead of the call
    fn fail_to_launch(&self, entry: &mut JobEntry, error: RunnerError) {
        log::warn!(
            "[JobOrchestrator] Job {} could not start an agent: {}",
            entry.job.id,
            error
        );
        let message = format!("Failed to start agent: {}", error);
        self.finish(
            entry,
            JobStatus::Failed,
            message.clone(),
            AgentEvent::failure(message),
        );
    }
}

/// Wait for a run's sink to exit. A sink that panicked drops its sender, which
/// also ends the wait.
async fn wait_for_run(mut done: RunDone) {
    if done.wait_for(|finished| *finished).await.is_err() {
        log::error!("[JobOrchestrator] Sink task ended without reporting completion");
    }
}

/// Instruction for a fresh run that continues a job after a clarification
fn resume_instruction(job: &Job, question: &str, reply: &str) -> String {
    let skip = job.logs.len().saturating_sub(RESUME_LOG_LINES);
    let transcript = job.logs[skip..]
        .iter()
        .map(|entry| format!("- {}", ellipsize(&entry.message, 500)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{prompt}\n\n\
         ## Progress so far\n{transcript}\n\n\
         ## Your question\n{question}\n\n\
         ## Answer from the user\n{reply}\n\n\
         Continue the task using this answer. Work from the previous run is already committed on this branch.",
        prompt = job.prompt,
        transcript = transcript,
        question = question,
        reply = reply,
    )
}
