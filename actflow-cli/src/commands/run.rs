use crate::commands::parse_pairs;
use crate::output;

use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use actflow_engine::execution::LogLevel;
use actflow_engine::{
    progress_channel, Conclusion, EngineConfig, EventInfo, ExecutionEvent, NoopAction,
    RunRequest, RunnerRegistry, WorkflowEngine, WorkflowParser,
};

/// Run a workflow locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Name of the triggering event
    #[arg(long, default_value = "push")]
    pub event: String,

    /// Git ref of the event
    #[arg(long = "ref", default_value = "refs/heads/main", value_name = "REF")]
    pub git_ref: String,

    #[arg(long, default_value = "0000000000000000000000000000000000000000")]
    pub sha: String,

    #[arg(long, default_value = "local")]
    pub actor: String,

    /// Set a secret (can be repeated, format: NAME=VALUE)
    #[arg(long = "secret", short = 's', value_name = "NAME=VALUE")]
    pub secrets: Vec<String>,

    /// Load secrets from a dotenv file
    #[arg(long, value_name = "FILE")]
    pub secrets_file: Option<PathBuf>,

    /// Set a variable (can be repeated, format: NAME=VALUE)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Set a dispatch input (can be repeated, format: NAME=VALUE)
    #[arg(long = "input", short = 'i', value_name = "NAME=VALUE")]
    pub inputs: Vec<String>,

    /// Maximum jobs running at once
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Engine configuration file (YAML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Working directory for execution
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Run even if the workflow's triggers do not match the event
    #[arg(long)]
    pub force: bool,

    /// Treat actions with no local runner as successful no-ops
    #[arg(long)]
    pub allow_missing_actions: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let workflow_path = &args.workflow;
    if !workflow_path.exists() {
        bail!("Workflow file not found: {}", workflow_path.display());
    }

    output::status("Parsing", &format!("{}", workflow_path.display()));
    let workflow = WorkflowParser::from_file(workflow_path)
        .map_err(|e| eyre!("Invalid workflow: {}", e))?;

    for issue in WorkflowParser::lint_expressions(&workflow) {
        output::warning(&format!("{}: {}", issue.location, issue.error));
    }

    let event = EventInfo::new(&args.event)
        .with_ref(&args.git_ref)
        .with_sha(&args.sha)
        .with_actor(&args.actor);
    if !workflow.accepts(&event) {
        if !args.force {
            bail!(
                "Workflow is not triggered by '{}' on {} (use --force to run anyway)",
                args.event,
                args.git_ref
            );
        }
        output::warning("Triggers do not match the event; running anyway");
    }

    let mut config = load_config(args.config.as_deref())?;
    if let Some(max) = args.max_parallel {
        config.max_parallel_jobs = max;
    }
    if let Some(dir) = args.working_dir.clone() {
        config.working_dir = Some(dir);
    }

    let mut secrets = match &args.secrets_file {
        Some(path) => load_secrets_file(path)?,
        None => IndexMap::new(),
    };
    secrets.extend(parse_pairs("--secret", &args.secrets)?);

    let mut request = RunRequest::new(event);
    request.secrets = secrets;
    request.vars = parse_pairs("--var", &args.variables)?;
    request.inputs = parse_pairs("--input", &args.inputs)?;

    let mut runners = RunnerRegistry::new();
    if args.allow_missing_actions {
        runners = runners.with_fallback(NoopAction);
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = progress_channel();
    let engine = WorkflowEngine::new(workflow)
        .map_err(|e| eyre!("Invalid workflow: {}", e))?
        .with_config(config)
        .with_actions(runners)
        .with_progress(tx)
        .with_cancellation(cancel.clone());

    output::info(&format!(
        "Workflow '{}': {} jobs, {} job instances",
        engine.workflow().display_name("workflow"),
        engine.graph().jobs().len(),
        engine.graph().instance_count()
    ));

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let exec_handle = tokio::spawn(async move { engine.run(request).await });

    while let Some(event) = rx.recv().await {
        print_event(&event);
    }

    let result = exec_handle.await??;

    println!();
    for job in &result.jobs {
        let detail = job
            .error
            .as_deref()
            .filter(|_| job.conclusion != Conclusion::Skipped);
        output::summary_row(&job.name, job.conclusion, detail);
    }

    if !result.is_success() {
        std::process::exit(1);
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read config {}", path.display()))?;
    serde_yaml::from_str(&content)
        .wrap_err_with(|| format!("Invalid config {}", path.display()))
}

fn load_secrets_file(path: &Path) -> Result<IndexMap<String, String>> {
    let mut secrets = IndexMap::new();
    let entries = dotenvy::from_path_iter(path)
        .wrap_err_with(|| format!("Failed to read secrets file {}", path.display()))?;
    for entry in entries {
        let (name, value) =
            entry.wrap_err_with(|| format!("Invalid secrets file {}", path.display()))?;
        secrets.insert(name, value);
    }
    Ok(secrets)
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            workflow,
            run_id,
            total_jobs,
        } => {
            println!();
            output::header(&format!(
                "Workflow '{}' run {} ({} jobs)",
                workflow, run_id, total_jobs
            ));
        }

        ExecutionEvent::RunCompleted {
            status, duration, ..
        } => {
            println!();
            output::run_finished(*status, duration.as_secs_f64());
        }

        ExecutionEvent::JobStarted {
            job, total_steps, ..
        } => {
            println!("    Job '{}' ({} steps)", job, total_steps);
        }

        ExecutionEvent::JobCompleted {
            job,
            conclusion,
            duration,
            ..
        } => {
            let line = format!("Job '{}' {} ({:.2}s)", job, conclusion, duration.as_secs_f64());
            output::concluded(4, *conclusion, &line);
        }

        ExecutionEvent::JobSkipped {
            job,
            conclusion,
            reason,
            ..
        } => {
            output::warning(&format!("    Job '{}' {}: {}", job, conclusion, reason));
        }

        ExecutionEvent::StepStarted {
            step_name,
            step_index,
            ..
        } => {
            println!("      [Step {}] {}", step_index + 1, step_name);
        }

        ExecutionEvent::StepOutput {
            output, is_error, ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::step_error(line);
                } else {
                    output::step_output(line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            outcome,
            conclusion,
            duration,
            ..
        } => {
            let rescued = if outcome != conclusion {
                format!(" (outcome: {})", outcome)
            } else {
                String::new()
            };
            let line = format!("{} ({:.2}s){}", conclusion, duration.as_secs_f64(), rescued);
            output::concluded(8, *conclusion, &line);
        }

        ExecutionEvent::StepSkipped {
            step_name, reason, ..
        } => {
            output::warning(&format!("        {} skipped: {}", step_name, reason));
        }

        ExecutionEvent::OutputSet { name, value, .. } => {
            output::dim(&format!("        [output] {} = {}", name, value));
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            LogLevel::Info => output::info(message),
            LogLevel::Debug => output::dim(message),
        },
    }
}
