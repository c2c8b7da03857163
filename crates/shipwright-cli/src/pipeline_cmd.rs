//! `pipeline start/resume/status/abort/list/show` and the hidden
//! `pipeline run-worker` re-exec target.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use shipwright_pipeline::{load_state, run_pipeline, save_state, state_path, PipelineContext, PipelineOutcome, PipelineSummary, SubprocessAiAgent};
use shipwright_supervisor::launcher::{failure_marker_line, success_marker_line};
use shipwright_types::{PipelineState, Template};

fn ai_command(model_override: Option<&str>) -> Vec<String> {
    let mut command: Vec<String> = std::env::var("SHIPWRIGHT_AI_COMMAND")
        .ok()
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_else(|| vec!["claude".to_string(), "-p".to_string()]);
    if let Some(model) = model_override {
        command.push("--model".to_string());
        command.push(model.to_string());
    }
    command
}

pub fn start(goal: Option<String>, issue: Option<u64>, template_name: String, branch: Option<String>, base_branch: String) -> Result<()> {
    let issue_id = issue.unwrap_or(0);
    let goal = goal
        .or_else(|| issue.map(|id| format!("resolve issue #{id}")))
        .context("either --goal or --issue is required")?;
    let title = goal.lines().next().unwrap_or(&goal).to_string();
    let workspace = std::env::current_dir()?;
    let branch = branch.unwrap_or_else(|| format!("shipwright/local-{issue_id}"));

    let config_path = shipwright_config::config_path(&workspace);
    let config = shipwright_config::load_or_default(&config_path);

    let template = Template::builtin(&template_name)
        .with_context(|| format!("unknown template \"{template_name}\"; see `shipwright pipeline list`"))?;

    let mut ctx = PipelineContext::new(workspace.clone(), issue_id, title.clone(), goal.clone(), branch, base_branch, config.clone());
    let mut state = PipelineState::new(issue_id, goal, template.name.clone(), ctx.branch.clone());

    let agent = SubprocessAiAgent::new(ai_command(config.model.as_deref()));
    let outcome = run_pipeline(&mut ctx, &template, &agent, None, &mut state, None)?;

    match outcome {
        PipelineOutcome::Success => {
            println!("pipeline succeeded for #{issue_id}");
            Ok(())
        }
        PipelineOutcome::Failed(class) => {
            println!("pipeline failed for #{issue_id}: {class:?}");
            std::process::exit(1);
        }
    }
}

pub fn resume() -> Result<()> {
    let workspace = std::env::current_dir()?;
    let Some(mut state) = load_state(&workspace)? else {
        bail!("no pipeline state found at {}", state_path(&workspace).display());
    };
    let template = Template::builtin(&state.template)
        .with_context(|| format!("unknown template \"{}\" in saved state", state.template))?;

    let config_path = shipwright_config::config_path(&workspace);
    let config = shipwright_config::load_or_default(&config_path);

    let resume_from = state.current_stage.clone();
    let mut ctx = PipelineContext::new(
        workspace.clone(),
        state.issue_id,
        state.goal.lines().next().unwrap_or_default(),
        state.goal.clone(),
        state.branch.clone(),
        config.base_branch.clone(),
        config.clone(),
    );

    let agent = SubprocessAiAgent::new(ai_command(config.model.as_deref()));
    let outcome = run_pipeline(&mut ctx, &template, &agent, None, &mut state, Some(&resume_from))?;

    match outcome {
        PipelineOutcome::Success => println!("pipeline resumed and succeeded for #{}", state.issue_id),
        PipelineOutcome::Failed(class) => {
            println!("pipeline resumed and failed for #{}: {class:?}", state.issue_id);
            std::process::exit(1);
        }
    }
    Ok(())
}

pub fn status() -> Result<()> {
    let workspace = std::env::current_dir()?;
    let Some(state) = load_state(&workspace)? else {
        println!("no pipeline state found at {}", state_path(&workspace).display());
        return Ok(());
    };
    let summary = PipelineSummary::from_state(&state);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

pub fn abort() -> Result<()> {
    let workspace = std::env::current_dir()?;
    let path = state_path(&workspace);
    if !path.exists() {
        println!("no pipeline state to abort");
        return Ok(());
    }
    std::fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
    println!("removed {}", path.display());
    Ok(())
}

pub fn list() {
    for name in ["fast", "standard", "full", "hotfix", "enterprise"] {
        let template = Template::builtin(name).expect("builtin template");
        println!("{:<10} {} stage(s), {} retr(y/ies), {} cycle(s)", template.name, template.stages.len(), template.build_test_retries, template.max_cycles);
    }
}

pub fn show(name: &str) -> Result<()> {
    let template = Template::builtin(name).with_context(|| format!("unknown template \"{name}\""))?;
    println!("{}", serde_json::to_string_pretty(&template)?);
    Ok(())
}

/// Arguments for the hidden `pipeline run-worker` subcommand. Field
/// names and flags must stay in lockstep with
/// `shipwright_supervisor::launcher::SelfExecLauncher::spawn`, which
/// builds exactly this invocation when it re-execs the daemon binary.
pub struct RunWorkerArgs {
    pub issue: u64,
    pub workspace: PathBuf,
    pub repo_root: PathBuf,
    pub template: String,
    pub title: String,
    pub goal: String,
    pub branch: String,
    pub base_branch: String,
    pub config: PathBuf,
    pub log_file: PathBuf,
    pub resume: bool,
    pub model: Option<String>,
}

/// Entry point for a spawned worker process. Never returns `Err` to the
/// caller in the ordinary failure path — a failed pipeline still exits
/// 0 after writing the failure marker, so the supervisor's log-tail
/// based reap logic (not the wait-status) is authoritative
/// "Subprocess reparenting").
pub fn run_worker(args: RunWorkerArgs) -> Result<()> {
    eprintln!("worker for issue #{} logging to {}", args.issue, args.log_file.display());
    let config = shipwright_config::load_or_default(&args.config);
    let template = Template::builtin(&args.template)
        .with_context(|| format!("unknown template \"{}\"", args.template))?;

    let mut ctx = PipelineContext::new(
        args.workspace.clone(),
        args.issue,
        args.title.clone(),
        args.goal.clone(),
        args.branch.clone(),
        args.base_branch.clone(),
        config.clone(),
    );

    let resume_from = if args.resume {
        load_state(&args.workspace)?.map(|s| s.current_stage)
    } else {
        None
    };

    let mut state = load_state(&args.workspace)?
        .unwrap_or_else(|| PipelineState::new(args.issue, args.goal.clone(), template.name.clone(), args.branch.clone()));

    let agent = SubprocessAiAgent::new(ai_command(args.model.as_deref()));
    let outcome = run_pipeline(&mut ctx, &template, &agent, None, &mut state, resume_from.as_deref());

    match outcome {
        Ok(PipelineOutcome::Success) => {
            print!("{}", success_marker_line());
            save_state(&args.workspace, &state)?;
            Ok(())
        }
        Ok(PipelineOutcome::Failed(class)) => {
            print!("{}", failure_marker_line(class));
            save_state(&args.workspace, &state)?;
            Ok(())
        }
        Err(err) => {
            eprintln!("pipeline execution error: {err:#}");
            print!("{}", failure_marker_line(shipwright_retry::FailureClass::Unknown));
            Ok(())
        }
    }
}
