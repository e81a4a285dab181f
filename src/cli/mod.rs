#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use crate::config;
use crate::core::git;
use crate::logging;
use crate::queue::scheduler::{Scheduler, WorkerOptions};
use crate::supervisor::{self, SupervisorOptions};

#[derive(Debug, Parser)]
#[command(
    name = "qworker",
    version,
    about = "Headless task-queue worker for CLI tools"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the worker loop in the foreground
    Run(RunArgs),
    /// Supervise a worker: restart it on exit or stale heartbeat
    Supervise(SuperviseArgs),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Repository the worker operates on (default: enclosing git repo)
    #[arg(long)]
    pub repo: Option<String>,
    /// Task queue directory (default: <repo>/.tasks)
    #[arg(long = "tasks-dir")]
    pub tasks_dir: Option<String>,
    /// Log directory (default: <repo>/logs)
    #[arg(long = "logs-dir")]
    pub logs_dir: Option<String>,
    /// Main loop poll interval in seconds
    #[arg(long = "poll-seconds", default_value_t = 3)]
    pub poll_seconds: u64,
    /// Policy file (default: <repo>/queueworker.toml)
    #[arg(long)]
    pub config: Option<String>,
}

#[derive(Debug, Parser)]
pub struct SuperviseArgs {
    /// Worker executable (default: this binary with `run`)
    #[arg(long)]
    pub worker: Option<PathBuf>,
    /// Heartbeat age in seconds after which the worker counts as hung
    #[arg(long = "heartbeat-stale-sec", default_value_t = 20)]
    pub heartbeat_stale_sec: u64,
    #[command(flatten)]
    pub run: RunArgs,
}

struct WorkerPaths {
    repo: PathBuf,
    tasks_dir: PathBuf,
    logs_dir: PathBuf,
    policy_file: PathBuf,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.cmd {
        Commands::Run(args) => run_worker(args).await,
        Commands::Supervise(args) => run_supervisor(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("qworker: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn resolve_paths(args: &RunArgs) -> anyhow::Result<WorkerPaths> {
    let repo = match &args.repo {
        Some(r) => config::expand_path(r)?,
        None => {
            let cwd = std::env::current_dir().context("failed to get current directory")?;
            git::find_repo_root(&cwd).unwrap_or(cwd)
        }
    };
    let tasks_dir = match &args.tasks_dir {
        Some(d) => config::expand_path(d)?,
        None => repo.join(".tasks"),
    };
    let logs_dir = match &args.logs_dir {
        Some(d) => config::expand_path(d)?,
        None => repo.join("logs"),
    };
    let policy_file = match &args.config {
        Some(c) => config::expand_path(c)?,
        None => repo.join(config::POLICY_FILE),
    };
    Ok(WorkerPaths {
        repo,
        tasks_dir,
        logs_dir,
        policy_file,
    })
}

async fn run_worker(args: RunArgs) -> anyhow::Result<()> {
    let paths = resolve_paths(&args)?;
    let policy = config::load(&paths.policy_file)?;

    let human_log = paths.logs_dir.join("queueworker.log");
    logging::rotate_oversized(&human_log, policy.queue.log_rotate_max_mb)?;
    logging::init(Some(&human_log))?;

    let opts = WorkerOptions {
        repo: paths.repo,
        tasks_dir: paths.tasks_dir,
        logs_dir: paths.logs_dir,
        poll: Duration::from_secs(args.poll_seconds.max(1)),
    };
    let mut scheduler = Scheduler::new(opts, policy)?;
    scheduler.run().await
}

async fn run_supervisor(args: SuperviseArgs) -> anyhow::Result<()> {
    let paths = resolve_paths(&args.run)?;
    logging::init(None)?;

    let mut argv: Vec<String> = Vec::new();
    let program = match &args.worker {
        Some(p) => p.clone(),
        None => {
            argv.push("run".to_owned());
            std::env::current_exe().context("failed to locate current executable")?
        }
    };
    argv.push("--repo".to_owned());
    argv.push(paths.repo.to_string_lossy().into_owned());
    if let Some(d) = &args.run.tasks_dir {
        argv.push("--tasks-dir".to_owned());
        argv.push(d.clone());
    }
    if let Some(d) = &args.run.logs_dir {
        argv.push("--logs-dir".to_owned());
        argv.push(d.clone());
    }
    if let Some(c) = &args.run.config {
        argv.push("--config".to_owned());
        argv.push(c.clone());
    }
    argv.push("--poll-seconds".to_owned());
    argv.push(args.run.poll_seconds.to_string());

    supervisor::supervise(SupervisorOptions {
        program,
        args: argv,
        state_dir: paths.repo.join(".state"),
        heartbeat_stale: Duration::from_secs(args.heartbeat_stale_sec.max(1)),
        check_every: Duration::from_secs(5),
    })
    .await
}
