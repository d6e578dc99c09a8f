use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use actflow_engine::WorkflowEngine;

/// Print the concrete instances each job expands to
#[derive(Args, Debug)]
pub struct MatrixArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Only show this job
    #[arg(long, value_name = "JOB")]
    pub job: Option<String>,
}

pub fn execute(args: MatrixArgs) -> Result<()> {
    let engine = WorkflowEngine::from_file(&args.workflow)
        .map_err(|e| eyre!("Invalid workflow: {}", e))?;

    let job_ids: Vec<String> = match &args.job {
        Some(job) => vec![job.clone()],
        None => engine.workflow().jobs.keys().cloned().collect(),
    };

    for id in &job_ids {
        let instances = engine.instances_of(id)?;
        output::header(&format!("{} ({} instances)", id, instances.len()));
        if instances.is_empty() {
            output::warning("every combination is excluded; the job will be skipped");
        }
        for instance in instances {
            let values: Vec<String> = instance
                .values
                .iter()
                .map(|(axis, value)| format!("{}={}", axis, value.to_json_string()))
                .collect();
            println!("  {:<30} {}", instance.display_name(id), values.join(" "));
        }
    }

    Ok(())
}
