mod cleanup;
mod daemon;
mod error;
mod pipeline_cmd;
mod reporter;
mod repo;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "shipwright", version)]
#[command(about = "Autonomous delivery supervisor: polls a tracker, spawns and supervises pipeline workers, and self-tunes over time")]
struct Cli {
    /// Repository the daemon drives pipelines against (default: current directory).
    #[arg(long, global = true, default_value = ".")]
    repo_root: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Daemon lifecycle and introspection.
    #[command(subcommand)]
    Daemon(DaemonCommands),
    /// Run or inspect a single pipeline.
    #[command(subcommand)]
    Pipeline(PipelineCommands),
    /// Remove orphaned worktrees, artifacts, stale heartbeats, and dead branches.
    Cleanup {
        /// Actually remove what would otherwise only be reported.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommands {
    /// Emit a default config document with documented fields.
    Init,
    /// Acquire the PID lock and run the poll loop until stopped.
    Start {
        /// Explicit config path; defaults to `<repo>/.claude/daemon-config.json`.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Placeholder for detached/background operation; the caller is
        /// expected to background this process themselves (e.g. via
        /// `nohup` or a process supervisor) — this flag only documents intent.
        #[arg(long)]
        detach: bool,
        /// Run the poll loop against an empty, inert tracker (no network
        /// calls); useful for exercising the daemon's other subsystems locally.
        #[arg(long)]
        no_tracker: bool,
    },
    /// Signal a running daemon to shut down.
    Stop,
    /// Print active, queued, and recently completed jobs.
    Status,
    /// Tail the daemon's event log.
    Logs {
        #[arg(long)]
        follow: bool,
    },
    /// Print DORA and throughput metrics.
    Metrics {
        #[arg(long, default_value_t = 30)]
        period: i64,
        #[arg(long)]
        json: bool,
    },
    /// Print current candidates with scores and selected templates.
    Triage,
    /// Run a patrol scan on demand.
    Patrol {
        /// Accepted for CLI-surface symmetry with the periodic patrol;
        /// a manual invocation is always a single run.
        #[arg(long)]
        once: bool,
        /// Report findings without filing issues for them.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PipelineCommands {
    /// Run one pipeline in the current repository.
    Start {
        #[arg(long)]
        goal: Option<String>,
        #[arg(long)]
        issue: Option<u64>,
        #[arg(long, default_value = "standard")]
        template: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value = "main")]
        base_branch: String,
    },
    /// Resume a pipeline from its last checkpoint.
    Resume,
    /// Print the local pipeline state file as JSON.
    Status,
    /// Discard the local pipeline state file.
    Abort,
    /// List the built-in templates.
    List,
    /// Print one template's stage list as JSON.
    Show { name: String },
    /// Run a pipeline worker in this process. Invoked by the
    /// supervisor's self-exec launcher; not meant to be run by hand.
    #[command(hide = true, name = "run-worker")]
    RunWorker {
        #[arg(long)]
        issue: u64,
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        repo_root: PathBuf,
        #[arg(long)]
        template: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        goal: String,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        base_branch: String,
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        log_file: PathBuf,
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        model: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match cli.cmd {
        Commands::Daemon(cmd) => run_daemon(cli.repo_root, cmd),
        Commands::Pipeline(cmd) => run_pipeline(cli.repo_root, cmd),
        Commands::Cleanup { force } => cleanup::run(cli.repo_root, force),
    };

    if let Err(err) = &result {
        if let Some(shipwright_err) = err.downcast_ref::<error::ShipwrightError>() {
            eprintln!("error: {shipwright_err}");
            std::process::exit(shipwright_err.exit_code());
        }
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }

    Ok(())
}

fn run_daemon(repo_root: PathBuf, cmd: DaemonCommands) -> Result<()> {
    match cmd {
        DaemonCommands::Init => daemon::init(&repo_root),
        DaemonCommands::Start { config, detach: _, no_tracker } => daemon::start(repo_root, config, no_tracker),
        DaemonCommands::Stop => daemon::stop(repo_root),
        DaemonCommands::Status => daemon::status(repo_root),
        DaemonCommands::Logs { follow } => daemon::logs(repo_root, follow),
        DaemonCommands::Metrics { period, json } => daemon::metrics(repo_root, period, json),
        DaemonCommands::Triage => daemon::triage(repo_root),
        DaemonCommands::Patrol { once, dry_run } => daemon::patrol(repo_root, once, dry_run),
    }
}

fn run_pipeline(_repo_root: PathBuf, cmd: PipelineCommands) -> Result<()> {
    match cmd {
        PipelineCommands::Start { goal, issue, template, branch, base_branch } => {
            pipeline_cmd::start(goal, issue, template, branch, base_branch)
        }
        PipelineCommands::Resume => pipeline_cmd::resume(),
        PipelineCommands::Status => pipeline_cmd::status(),
        PipelineCommands::Abort => pipeline_cmd::abort(),
        PipelineCommands::List => {
            pipeline_cmd::list();
            Ok(())
        }
        PipelineCommands::Show { name } => pipeline_cmd::show(&name),
        PipelineCommands::RunWorker {
            issue,
            workspace,
            repo_root,
            template,
            title,
            goal,
            branch,
            base_branch,
            config,
            log_file,
            resume,
            model,
        } => pipeline_cmd::run_worker(pipeline_cmd::RunWorkerArgs {
            issue,
            workspace,
            repo_root,
            template,
            title,
            goal,
            branch,
            base_branch,
            config,
            log_file,
            resume,
            model,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_verifies_clean() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_worker_is_hidden_from_help() {
        let cmd = Cli::command();
        let pipeline = cmd
            .get_subcommands()
            .find(|c| c.get_name() == "pipeline")
            .expect("pipeline subcommand");
        let run_worker = pipeline
            .get_subcommands()
            .find(|c| c.get_name() == "run-worker")
            .expect("run-worker subcommand");
        assert!(run_worker.is_hide_set());
    }
}
