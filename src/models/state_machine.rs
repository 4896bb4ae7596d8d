// Job status state machine with validation

use super::JobStatus;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job already in terminal state: {0}")]
    AlreadyTerminal(JobStatus),
}

/// Validates if a job can transition from one status to another.
/// Status only ever moves forward; COMPLETED and FAILED accept nothing.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    match (from, to) {
        // From Pending
        (JobStatus::Pending, JobStatus::Running) => true,
        (JobStatus::Pending, JobStatus::Failed) => true, // Runner could not be created

        // From Running
        (JobStatus::Running, JobStatus::Completed) => true,
        (JobStatus::Running, JobStatus::Failed) => true,
        (JobStatus::Running, JobStatus::WaitingForUser) => true,

        // From WaitingForUser
        (JobStatus::WaitingForUser, JobStatus::Running) => true, // Clarification supplied
        (JobStatus::WaitingForUser, JobStatus::Failed) => true,  // Cancelled while waiting

        _ => false,
    }
}

/// Validates and performs a state transition
pub fn transition_state(
    current: JobStatus,
    target: JobStatus,
) -> Result<JobStatus, StateTransitionError> {
    if is_terminal_state(current) {
        return Err(StateTransitionError::AlreadyTerminal(current));
    }

    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a status is a terminal state
pub fn is_terminal_state(status: JobStatus) -> bool {
    matches!(status, JobStatus::Completed | JobStatus::Failed)
}

/// Check if a status indicates a job with a live or resumable agent
pub fn is_active_state(status: JobStatus) -> bool {
    matches!(status, JobStatus::Running | JobStatus::WaitingForUser)
}

/// Get all valid next states from current state
pub fn valid_next_states(current: JobStatus) -> Vec<JobStatus> {
    let all_states = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::WaitingForUser,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    all_states
        .into_iter()
        .filter(|&state| can_transition(current, state))
        .collect()
}
