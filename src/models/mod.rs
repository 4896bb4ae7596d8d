// Data models shared with the job intake and persistence layers

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use self::state_machine::{transition_state, StateTransitionError};

/// Job identifiers are assigned by the intake layer and never change.
pub type JobId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    WaitingForUser,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::WaitingForUser => "WAITING_FOR_USER",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A timestamped line in a job's durable history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A file generated while working on a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub filename: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub prompt: String,
    pub status: JobStatus,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl Job {
    /// Create a new job in the PENDING state
    pub fn new(id: JobId, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            prompt: prompt.into(),
            status: JobStatus::Pending,
            assignee: None,
            created_at: now,
            updated_at: now,
            logs: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Git branch the job's changes land on
    pub fn branch_name(&self) -> String {
        crate::git::job_branch_name(self.id)
    }

    pub fn is_terminal(&self) -> bool {
        state_machine::is_terminal_state(self.status)
    }

    /// Move to `target`, returning the previous status.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<JobStatus, StateTransitionError> {
        let previous = self.status;
        self.status = transition_state(previous, target)?;
        self.updated_at = Utc::now();
        Ok(previous)
    }

    /// Append a log entry. Allowed in every state, including terminal ones.
    pub fn append_log(&mut self, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        };
        self.updated_at = entry.timestamp;
        self.logs.push(entry.clone());
        entry
    }

    /// Record a generated file. Allowed in every state, including terminal ones.
    pub fn add_artifact(
        &mut self,
        filename: impl Into<String>,
        content: impl Into<String>,
    ) -> Artifact {
        let artifact = Artifact {
            filename: filename.into(),
            content: content.into(),
            created_at: Utc::now(),
        };
        self.updated_at = artifact.created_at;
        self.artifacts.push(artifact.clone());
        artifact
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    /// Isolated run inside a container
    Docker,
    /// Direct run in a sandboxed checkout on the host filesystem
    FileSystem,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Docker => "DOCKER",
            AgentType::FileSystem => "FILE_SYSTEM",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "docker" => Ok(AgentType::Docker),
            "file_system" | "filesystem" => Ok(AgentType::FileSystem),
            _ => Err(format!(
                "Unknown agent type: '{}'. Expected one of: docker, file_system",
                s
            )),
        }
    }
}

impl Default for AgentType {
    fn default() -> Self {
        AgentType::FileSystem
    }
}

/// A named, reusable execution profile selected when a job starts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfiguration {
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    pub rules: Option<String>,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    pub agent_type: AgentType,
    pub project_id: String,
    pub user_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl AgentConfiguration {
    pub fn new(name: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            name: name.into(),
            description: None,
            system_prompt: String::new(),
            rules: None,
            skills: BTreeSet::new(),
            agent_type,
            project_id: String::new(),
            user_id: String::new(),
            is_active: true,
        }
    }

    /// Fold the system prompt, rules and skill names into the single prompt
    /// appended to the agent's own system prompt. Returns None when empty.
    pub fn compose_system_prompt(&self) -> Option<String> {
        let mut sections: Vec<String> = Vec::new();

        let base = self.system_prompt.trim();
        if !base.is_empty() {
            sections.push(base.to_string());
        }

        if let Some(rules) = self.rules.as_deref().map(str::trim) {
            if !rules.is_empty() {
                sections.push(format!("## Rules\n{}", rules));
            }
        }

        if !self.skills.is_empty() {
            let list = self
                .skills
                .iter()
                .map(|s| format!("- {}", s))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("## Available skills\n{}", list));
        }

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new(7, "add a README");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.branch_name(), "agent-job-7");
        assert!(job.logs.is_empty());
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_transition_bumps_updated_at() {
        let mut job = Job::new(1, "x");
        let before = job.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let previous = job.transition_to(JobStatus::Running).unwrap();
        assert_eq!(previous, JobStatus::Pending);
        assert!(job.updated_at > before);
    }

    #[test]
    fn test_logs_and_artifacts_append_after_terminal() {
        let mut job = Job::new(1, "x");
        job.transition_to(JobStatus::Running).unwrap();
        job.transition_to(JobStatus::Completed).unwrap();

        job.append_log("late cleanup message");
        job.add_artifact("notes.md", "# notes");

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.logs.len(), 1);
        assert_eq!(job.artifacts[0].filename, "notes.md");
    }

    #[test]
    fn test_job_status_serialization() {
        let json = serde_json::to_string(&JobStatus::WaitingForUser).unwrap();
        assert_eq!(json, "\"WAITING_FOR_USER\"");
        let status: JobStatus = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(status, JobStatus::Completed);
    }

    #[test]
    fn test_agent_type_from_str() {
        assert_eq!("docker".parse::<AgentType>().unwrap(), AgentType::Docker);
        assert_eq!(
            "FILE_SYSTEM".parse::<AgentType>().unwrap(),
            AgentType::FileSystem
        );
        assert_eq!(
            "file-system".parse::<AgentType>().unwrap(),
            AgentType::FileSystem
        );
        assert!("podman".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_compose_system_prompt() {
        let mut config = AgentConfiguration::new("reviewer", AgentType::Docker);
        assert!(config.compose_system_prompt().is_none());

        config.system_prompt = "You review code.".to_string();
        config.rules = Some("Never push.".to_string());
        config.skills.insert("rust".to_string());
        config.skills.insert("git".to_string());

        let prompt = config.compose_system_prompt().unwrap();
        assert!(prompt.starts_with("You review code."));
        assert!(prompt.contains("## Rules\nNever push."));
        // skills are listed in sorted order
        assert!(prompt.contains("- git\n- rust"));
    }

    #[test]
    fn test_agent_configuration_deserialization() {
        let json = r#"{
            "name": "default",
            "systemPrompt": "be helpful",
            "agentType": "FILE_SYSTEM",
            "projectId": "p1",
            "userId": "u1"
        }"#;
        let config: AgentConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.agent_type, AgentType::FileSystem);
        assert!(config.is_active);
        assert!(config.skills.is_empty());
    }
}
