// Agent execution: typed events, the runner contract and its two variants

pub mod container;
pub mod events;
pub mod format_parsers;
pub mod path_resolver;
mod process;
pub mod runner;
pub mod sandbox;

pub use container::ContainerRunner;
pub use events::{AgentEvent, ASK_USER_TOOL};
pub use format_parsers::ClaudeStreamParser;
pub use path_resolver::CliPathResolver;
pub use runner::{
    AgentRun, AgentRunner, ContainerSettings, DefaultRunnerFactory, JobContext, RunnerError,
    RunnerFactory, RunnerSettings,
};
pub use sandbox::SandboxRunner;
