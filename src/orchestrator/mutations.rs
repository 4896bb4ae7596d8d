// Mutation feed for the persistence layer
//
// Every change the orchestrator makes to a job is also emitted here so an
// external store can mirror it. The core never reads these back.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Artifact, JobId, JobStatus, LogEntry};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobMutation {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    LogAppended { job_id: JobId, entry: LogEntry },
    #[serde(rename_all = "camelCase")]
    ArtifactAdded { job_id: JobId, artifact: Artifact },
}

impl JobMutation {
    pub fn job_id(&self) -> JobId {
        match self {
            JobMutation::StatusChanged { job_id, .. }
            | JobMutation::LogAppended { job_id, .. }
            | JobMutation::ArtifactAdded { job_id, .. } => *job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_change_serialization() {
        let at = Utc::now();
        let mutation = JobMutation::StatusChanged {
            job_id: 3,
            from: JobStatus::Pending,
            to: JobStatus::Running,
            at,
        };
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["kind"], "status_changed");
        assert_eq!(json["jobId"], 3);
        assert_eq!(json["from"], "PENDING");
        assert_eq!(json["to"], "RUNNING");
        assert_eq!(mutation.job_id(), 3);
    }
}
