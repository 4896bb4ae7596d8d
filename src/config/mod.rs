// Layered application configuration
//
// Defaults <- global (~/.config/agent-jobs/config.toml) <- project
// (<repo>/.agent-jobs/config.toml) <- CLI overrides. Later layers override
// single keys, not whole sections.

mod merger;

pub use merger::{CliOverrides, ConfigMerger};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::{ContainerSettings, RunnerSettings};
use crate::git::{validate_branch_name, DEFAULT_BASE_BRANCH};
use crate::orchestrator::OrchestratorSettings;
use crate::utils::project_config_path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub git: GitConfig,
    pub runner: RunnerConfig,
    pub broadcast: BroadcastConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    #[serde(alias = "baseBranch")]
    pub base_branch: String,
    #[serde(alias = "gitBinary")]
    pub git_binary: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    #[serde(alias = "agentBinary")]
    pub agent_binary: PathBuf,
    pub model: Option<String>,
    #[serde(alias = "eventChannelCapacity")]
    pub event_channel_capacity: usize,
    #[serde(alias = "stopGraceSecs")]
    pub stop_grace_secs: u64,
    #[serde(alias = "workspaceRoot")]
    pub workspace_root: Option<PathBuf>,
    #[serde(alias = "partialMessages")]
    pub partial_messages: bool,
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    #[serde(alias = "dockerBinary")]
    pub docker_binary: PathBuf,
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    #[serde(alias = "bufferSize")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds without agent events before a job is failed; 0 or absent disables it
    #[serde(alias = "inactivityTimeoutSecs")]
    pub inactivity_timeout_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            git: GitConfig::default(),
            runner: RunnerConfig::default(),
            broadcast: BroadcastConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            git_binary: PathBuf::from("git"),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let settings = RunnerSettings::default();
        Self {
            agent_binary: settings.agent_binary,
            model: settings.model,
            event_channel_capacity: settings.event_channel_capacity,
            stop_grace_secs: settings.stop_grace.as_secs(),
            workspace_root: settings.workspace_root,
            partial_messages: settings.partial_messages,
            container: ContainerConfig::default(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        let settings = ContainerSettings::default();
        Self {
            docker_binary: settings.docker_binary,
            image: settings.image,
            memory: settings.memory,
            cpus: settings.cpus,
            env: settings.env,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::events::DEFAULT_BUFFER_SIZE,
        }
    }
}

impl AppConfig {
    /// Global config file path (e.g. ~/.config/agent-jobs/config.toml)
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("agent-jobs").join("config.toml"))
    }

    /// Load and merge every layer for a repository
    pub fn load(repo_path: &Path, cli: &CliOverrides) -> Result<Self> {
        let global = match Self::global_config_path() {
            Some(path) => read_table(&path)?,
            None => None,
        };
        let project = read_table(&project_config_path(repo_path))?;

        let config = ConfigMerger::new()
            .with_global(global)
            .with_project(project)
            .with_cli(Some(cli.clone()))
            .merge()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a single config document on top of the defaults
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(contents).map_err(|e| anyhow!("Failed to parse config: {}", e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_branch_name(&self.git.base_branch)
            .map_err(|e| anyhow!("Invalid git.base_branch: {}", e))?;

        if self.runner.event_channel_capacity == 0 {
            return Err(anyhow!("runner.event_channel_capacity must be greater than 0"));
        }
        if self.broadcast.buffer_size == 0 {
            return Err(anyhow!("broadcast.buffer_size must be greater than 0"));
        }
        if self.runner.container.image.trim().is_empty() {
            return Err(anyhow!("runner.container.image must not be empty"));
        }
        Ok(())
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        let runner = &self.runner;
        RunnerSettings {
            agent_binary: runner.agent_binary.clone(),
            model: runner.model.clone(),
            event_channel_capacity: runner.event_channel_capacity,
            stop_grace: Duration::from_secs(runner.stop_grace_secs),
            workspace_root: runner.workspace_root.clone(),
            partial_messages: runner.partial_messages,
            container: ContainerSettings {
                docker_binary: runner.container.docker_binary.clone(),
                image: runner.container.image.clone(),
                memory: runner.container.memory.clone(),
                cpus: runner.container.cpus.clone(),
                env: runner.container.env.clone(),
            },
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            inactivity_timeout: self
                .orchestrator
                .inactivity_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

/// Read one layer; a missing file is not an error
fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
    let table: toml::Table = toml::from_str(&contents)
        .map_err(|e| anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;

    log::debug!("[Config] Loaded {}", path.display());
    Ok(Some(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.git.base_branch, "main");
        assert_eq!(config.runner.agent_binary, PathBuf::from("claude"));
        assert_eq!(config.runner.event_channel_capacity, 256);
        assert_eq!(config.runner.stop_grace_secs, 10);
        assert_eq!(config.runner.container.memory, "2g");
        assert_eq!(config.runner.container.cpus, "2");
        assert_eq!(config.broadcast.buffer_size, 500);
        assert_eq!(config.orchestrator.inactivity_timeout_secs, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [runner]
            model = "opus"

            [runner.container]
            memory = "4g"
            "#,
        )
        .unwrap();

        assert_eq!(config.runner.model.as_deref(), Some("opus"));
        assert_eq!(config.runner.container.memory, "4g");
        assert_eq!(config.runner.container.cpus, "2");
        assert_eq!(config.git.base_branch, "main");
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = AppConfig::from_toml_str(
            r#"
            [git]
            baseBranch = "develop"

            [broadcast]
            bufferSize = 42

            [orchestrator]
            inactivityTimeoutSecs = 90
            "#,
        )
        .unwrap();

        assert_eq!(config.git.base_branch, "develop");
        assert_eq!(config.broadcast.buffer_size, 42);
        assert_eq!(
            config.orchestrator_settings().inactivity_timeout,
            Some(Duration::from_secs(90))
        );
    }

    #[test]
    fn test_zero_timeout_disables_it() {
        let mut config = AppConfig::default();
        config.orchestrator.inactivity_timeout_secs = Some(0);
        assert_eq!(config.orchestrator_settings().inactivity_timeout, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.runner.event_channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.broadcast.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.git.base_branch = "bad..branch".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_runner_settings_conversion() {
        let mut config = AppConfig::default();
        config.runner.stop_grace_secs = 3;
        config.runner.container.env = vec!["FOO".to_string()];

        let settings = config.runner_settings();
        assert_eq!(settings.stop_grace, Duration::from_secs(3));
        assert_eq!(settings.container.env, vec!["FOO".to_string()]);
        assert_eq!(settings.event_channel_capacity, 256);
    }

    #[test]
    fn test_load_reads_project_file() {
        let repo = TempDir::new().unwrap();
        let path = project_config_path(repo.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[git]\nbase_branch = \"trunk\"\n").unwrap();

        let cli = CliOverrides {
            model: Some("sonnet".to_string()),
            ..Default::default()
        };
        let config = AppConfig::load(repo.path(), &cli).unwrap();

        // A global file on the test machine could set other keys; these two are ours
        assert_eq!(config.git.base_branch, "trunk");
        assert_eq!(config.runner.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn test_load_reports_unparseable_project_file() {
        let repo = TempDir::new().unwrap();
        let path = project_config_path(repo.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[git\nbase_branch = ").unwrap();

        let err = AppConfig::load(repo.path(), &CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
