use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;

use agent_jobs_lib::config::CliOverrides;
use agent_jobs_lib::shutdown::{register_signal_handlers, ShutdownState};
use agent_jobs_lib::{
    build_orchestrator, AgentConfiguration, AgentEvent, AgentType, AppConfig, Job, JobId,
    JobMutation, JobOrchestrator, JobStatus,
};

/// Agent Jobs - run autonomous coding agents on isolated job branches
#[derive(Parser, Debug)]
#[command(name = "agent-jobs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project repository (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OverrideArgs {
    /// Branch job branches are created from and compared against
    #[arg(long, global = true, env = "AGENT_JOBS_BASE_BRANCH")]
    base_branch: Option<String>,

    /// Agent CLI to run
    #[arg(long, global = true)]
    agent_binary: Option<PathBuf>,

    /// Model passed to the agent
    #[arg(long, global = true, env = "AGENT_JOBS_MODEL")]
    model: Option<String>,

    /// Container image for docker runs
    #[arg(long, global = true)]
    image: Option<String>,

    /// Parent directory for job worktrees
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    /// Fail a job after this many seconds without agent output (0 disables)
    #[arg(long, global = true)]
    inactivity_timeout: Option<u64>,
}

impl From<&OverrideArgs> for CliOverrides {
    fn from(args: &OverrideArgs) -> Self {
        CliOverrides {
            base_branch: args.base_branch.clone(),
            agent_binary: args.agent_binary.clone(),
            model: args.model.clone(),
            image: args.image.clone(),
            workspace_root: args.workspace_root.clone(),
            inactivity_timeout_secs: args.inactivity_timeout,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job and stream its events until it finishes
    Run {
        /// Instruction for the agent
        prompt: String,

        /// Job id; the job's branch is agent-job-<id>
        #[arg(long, default_value_t = 1)]
        job_id: JobId,

        /// docker or file_system
        #[arg(long, default_value = "file_system")]
        agent_type: AgentType,

        /// Extra system prompt for the agent
        #[arg(long)]
        system_prompt: Option<String>,

        /// Print events as JSON lines instead of text
        #[arg(long)]
        json: bool,
    },
    /// Report files changed by more than one job branch
    Conflicts {
        #[arg(required = true, num_args = 1..)]
        job_ids: Vec<JobId>,
    },
    /// Print a job branch's diff against the base branch
    Diff { job_id: JobId },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(execute(cli)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn execute(cli: Cli) -> Result<i32> {
    let repo = cli
        .repo
        .canonicalize()
        .with_context(|| format!("Repository path {} not found", cli.repo.display()))?;
    let config = AppConfig::load(&repo, &CliOverrides::from(&cli.overrides))?;
    let orchestrator = build_orchestrator(&repo, &config);

    match cli.command {
        Command::Run {
            prompt,
            job_id,
            agent_type,
            system_prompt,
            json,
        } => {
            let mut agent = AgentConfiguration::new("cli", agent_type);
            if let Some(system_prompt) = system_prompt {
                agent.system_prompt = system_prompt;
            }
            run_job(&orchestrator, Job::new(job_id, prompt), agent, json).await
        }
        Command::Conflicts { job_ids } => {
            let report = orchestrator.check_conflicts(&job_ids).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.has_conflicts { 2 } else { 0 })
        }
        Command::Diff { job_id } => {
            let diff = orchestrator.diff(job_id).await?;
            print!("{}", diff);
            Ok(0)
        }
    }
}

async fn run_job(
    orchestrator: &JobOrchestrator,
    job: Job,
    agent: AgentConfiguration,
    json: bool,
) -> Result<i32> {
    let shutdown = ShutdownState::new();
    if let Err(e) = register_signal_handlers(shutdown.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let job_id = job.id;
    let mut mutations = orchestrator.subscribe_mutations();
    let status = orchestrator.start(job, agent)?;
    let mut feed = orchestrator.attach(job_id)?;
    log::info!("Job {} is {}", job_id, status);

    loop {
        tokio::select! {
            event = feed.next() => match event {
                Some(event) => print_event(&event, json)?,
                None => break,
            },
            Some(mutation) = mutations.recv() => {
                if let JobMutation::StatusChanged { to: JobStatus::WaitingForUser, .. } = mutation {
                    let question = orchestrator.pending_question(job_id).unwrap_or_default();
                    let reply = ask(&question).await?;
                    orchestrator.respond(job_id, &reply).await?;
                }
            },
            _ = shutdown.wait() => {
                orchestrator.shutdown().await.log_summary();
                // Drain the final event
                while let Some(event) = feed.next().await {
                    print_event(&event, json)?;
                }
                break;
            },
        }
    }

    let job = orchestrator
        .job(job_id)
        .ok_or_else(|| anyhow!("Job {} disappeared", job_id))?;
    eprintln!("\nJob {} finished: {}", job_id, job.status);
    Ok(match job.status {
        JobStatus::Completed => 0,
        _ => 1,
    })
}

fn print_event(event: &AgentEvent, json: bool) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if json {
        writeln!(stdout, "{}", serde_json::to_string(event)?)?;
        return Ok(());
    }

    match event {
        AgentEvent::TextDelta { text } => write!(stdout, "{}", text)?,
        AgentEvent::ToolUseStarted { name } => writeln!(stdout, "\n[tool] {}", name)?,
        AgentEvent::ToolUseCompleted { .. } => {}
        AgentEvent::Result { ok, summary, errors } => {
            if *ok {
                writeln!(stdout, "\n[done] {}", summary)?;
            } else {
                writeln!(stdout, "\n[failed] {}", summary)?;
                for error in errors {
                    writeln!(stdout, "  {}", error)?;
                }
            }
        }
    }
    stdout.flush()?;
    Ok(())
}

/// Prompt on the terminal and read one line
async fn ask(question: &str) -> Result<String> {
    eprintln!("\nThe agent asks: {}", question);
    eprint!("> ");
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(line.trim().to_string())
}
