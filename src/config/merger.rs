// Configuration merging with priority

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use toml::{Table, Value};

use super::AppConfig;

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub base_branch: Option<String>,
    pub agent_binary: Option<PathBuf>,
    pub model: Option<String>,
    pub image: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub inactivity_timeout_secs: Option<u64>,
}

impl CliOverrides {
    fn to_table(&self) -> Table {
        let mut git = Table::new();
        if let Some(branch) = &self.base_branch {
            git.insert("base_branch".into(), Value::String(branch.clone()));
        }

        let mut container = Table::new();
        if let Some(image) = &self.image {
            container.insert("image".into(), Value::String(image.clone()));
        }

        let mut runner = Table::new();
        if let Some(binary) = &self.agent_binary {
            runner.insert(
                "agent_binary".into(),
                Value::String(binary.to_string_lossy().into_owned()),
            );
        }
        if let Some(model) = &self.model {
            runner.insert("model".into(), Value::String(model.clone()));
        }
        if let Some(root) = &self.workspace_root {
            runner.insert(
                "workspace_root".into(),
                Value::String(root.to_string_lossy().into_owned()),
            );
        }
        if !container.is_empty() {
            runner.insert("container".into(), Value::Table(container));
        }

        let mut orchestrator = Table::new();
        if let Some(secs) = self.inactivity_timeout_secs {
            // toml integers are i64
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            orchestrator.insert("inactivity_timeout_secs".into(), Value::Integer(secs));
        }

        let mut table = Table::new();
        for (name, section) in [("git", git), ("runner", runner), ("orchestrator", orchestrator)] {
            if !section.is_empty() {
                table.insert(name.into(), Value::Table(section));
            }
        }
        table
    }
}

/// Configuration merger
/// Priority order: CLI -> Project -> Global -> Defaults
#[derive(Debug, Default)]
pub struct ConfigMerger {
    global: Option<Table>,
    project: Option<Table>,
    cli: Option<CliOverrides>,
}

impl ConfigMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, config: Option<Table>) -> Self {
        self.global = config;
        self
    }

    pub fn with_project(mut self, config: Option<Table>) -> Self {
        self.project = config;
        self
    }

    pub fn with_cli(mut self, config: Option<CliOverrides>) -> Self {
        self.cli = config;
        self
    }

    /// Merge all layers over the defaults
    pub fn merge(&self) -> Result<AppConfig> {
        let mut result = Table::new();

        for layer in [&self.global, &self.project].into_iter().flatten() {
            merge_tables(&mut result, normalize_keys(layer.clone()));
        }
        if let Some(cli) = &self.cli {
            merge_tables(&mut result, cli.to_table());
        }

        Value::Table(result)
            .try_into()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))
    }
}

/// Deep merge: nested tables merge key by key, anything else is replaced
fn merge_tables(base: &mut Table, over: Table) {
    for (key, value) in over {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Rewrite camelCase keys to snake_case so two layers spelling the same key
/// differently still override each other
fn normalize_keys(table: Table) -> Table {
    table
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Table(inner) => Value::Table(normalize_keys(inner)),
                other => other,
            };
            (to_snake_case(&key), value)
        })
        .collect()
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
