use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use actflow_engine::{ExecutionGraph, WorkflowParser};

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Treat expression syntax problems as errors
    #[arg(long)]
    pub strict: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let workflow_path = &args.workflow;

    if !workflow_path.exists() {
        bail!("Workflow file not found: {}", workflow_path.display());
    }

    output::status("Validating", &format!("{}", workflow_path.display()));

    // Step 1: Parse against the document schema
    let content = std::fs::read_to_string(workflow_path)
        .wrap_err_with(|| format!("Failed to read {}", workflow_path.display()))?;
    let workflow = match WorkflowParser::parse(&content) {
        Ok(workflow) => workflow,
        Err(e) => {
            output::error(&format!("{}", e));
            std::process::exit(1);
        }
    };
    output::check("Schema valid");

    // Step 2: Structural rules and the needs graph
    if let Err(e) = WorkflowParser::validate(&workflow) {
        output::error(&format!("{}", e));
        std::process::exit(1);
    }
    let graph = match ExecutionGraph::from_workflow(&workflow) {
        Ok(graph) => graph,
        Err(e) => {
            output::error(&format!("{}", e));
            std::process::exit(1);
        }
    };

    let steps_count: usize = workflow.jobs.values().map(|j| j.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} job instances, {} steps",
        workflow.jobs.len(),
        graph.instance_count(),
        steps_count
    ));

    let triggers: Vec<String> = workflow
        .triggers()
        .iter()
        .map(|t| t.event_name().to_string())
        .collect();
    output::check(&format!("Triggers: {}", triggers.join(", ")));

    for (level, jobs) in graph.parallel_levels().iter().enumerate() {
        let ids: Vec<&str> = jobs.iter().map(|idx| graph.job(*idx).id.as_str()).collect();
        output::dim(&format!("    level {}: {}", level + 1, ids.join(", ")));
    }

    // Step 3: Expression syntax
    let issues = WorkflowParser::lint_expressions(&workflow);
    if issues.is_empty() {
        output::check("Expressions valid");
    } else {
        for issue in &issues {
            output::warning(&format!("{}: {}", issue.location, issue.error));
        }
        if args.strict {
            output::error(&format!("{} expression error(s)", issues.len()));
            std::process::exit(1);
        }
    }

    println!();
    output::check(&format!(
        "Workflow '{}' is valid",
        workflow.display_name("workflow")
    ));

    Ok(())
}
