// Run Context
// Per-run snapshot of github/runner/secrets/vars/inputs plus the append-only outputs ledger

use crate::error::{EngineError, EngineResult};
use crate::execution::results::Conclusion;
use crate::expression::{ExpressionContext, GithubContext, JobDependency, RunnerContext, Value};
use crate::workflow::models::WorkflowDocument;
use crate::workflow::trigger::{EventInfo, WorkflowInput};

use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// What to run: the triggering event plus externally supplied values
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub event: EventInfo,
    pub run_id: Option<String>,
    pub run_number: u64,
    pub repository: String,
    pub secrets: IndexMap<String, String>,
    pub vars: IndexMap<String, String>,
    /// Raw dispatch inputs, typed against the workflow's declarations
    pub inputs: IndexMap<String, String>,
}

impl RunRequest {
    pub fn new(event: EventInfo) -> Self {
        Self {
            event,
            run_id: None,
            run_number: 1,
            repository: String::new(),
            secrets: IndexMap::new(),
            vars: IndexMap::new(),
            inputs: IndexMap::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }
}

impl Default for RunRequest {
    fn default() -> Self {
        Self::new(EventInfo::new("workflow_dispatch"))
    }
}

/// Read-only run context, built once before the first job is dispatched
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub workflow: String,
    pub github: GithubContext,
    pub runner: RunnerContext,
    pub secrets: IndexMap<String, String>,
    pub vars: IndexMap<String, String>,
    pub inputs: IndexMap<String, Value>,
    /// Workflow-level env, unevaluated
    pub env: IndexMap<String, String>,
    pub workspace: PathBuf,
}

impl RunContext {
    /// Build the context for a run. Fails when a required input is missing
    /// or an input does not match its declared type.
    pub fn new(
        workflow: &WorkflowDocument,
        request: RunRequest,
        workspace: PathBuf,
    ) -> EngineResult<Self> {
        let declared = workflow.input_declarations(&request.event.name);
        let inputs = resolve_inputs(&declared, &request.inputs)?;

        let run_id = request.run_id.unwrap_or_else(generate_run_id);
        let workflow_name = workflow.display_name("workflow").to_string();
        let event = request.event;

        let (head_ref, base_ref) = if event.name.starts_with("pull_request") {
            (
                event.git_ref.clone(),
                event.base_ref.clone().unwrap_or_default(),
            )
        } else {
            (String::new(), String::new())
        };

        let github = GithubContext {
            event_name: event.name.clone(),
            git_ref: event.git_ref.clone(),
            sha: event.sha.clone(),
            actor: event.actor.clone(),
            repository: request.repository,
            run_id: run_id.clone(),
            run_number: request.run_number,
            workflow: workflow_name.clone(),
            job: None,
            head_ref,
            base_ref,
            workspace: workspace.to_string_lossy().into_owned(),
            event: event.payload.clone(),
        };

        Ok(Self {
            run_id,
            workflow: workflow_name,
            github,
            runner: RunnerContext::local(),
            secrets: request.secrets,
            vars: request.vars,
            inputs,
            env: workflow.env.clone(),
            workspace,
        })
    }

    /// Expression context outside any job: no `matrix`, `job` or `steps`
    pub fn expression_context(&self) -> ExpressionContext {
        ExpressionContext {
            github: self.github.clone(),
            runner: self.runner.clone(),
            secrets: self.secrets.clone(),
            vars: self.vars.clone(),
            inputs: self.inputs.clone(),
            workspace: self.workspace.clone(),
            ..Default::default()
        }
    }
}

/// Type raw inputs against their declarations and fill in defaults
pub fn resolve_inputs(
    declared: &IndexMap<String, WorkflowInput>,
    provided: &IndexMap<String, String>,
) -> EngineResult<IndexMap<String, Value>> {
    let mut inputs = IndexMap::new();

    for (name, decl) in declared {
        let raw = match provided.get(name) {
            Some(value) => Some(value.clone()),
            None => decl.default.as_ref().map(|d| Value::from(d).as_string()),
        };

        let Some(raw) = raw else {
            if decl.required {
                return Err(EngineError::MissingInput(name.clone()));
            }
            continue;
        };

        inputs.insert(name.clone(), typed_input(name, decl, &raw)?);
    }

    // Undeclared inputs pass through as strings
    for (name, value) in provided {
        if !inputs.contains_key(name) {
            inputs.insert(name.clone(), Value::String(value.clone()));
        }
    }

    Ok(inputs)
}

fn typed_input(name: &str, decl: &WorkflowInput, raw: &str) -> EngineResult<Value> {
    let invalid = |message: String| EngineError::InvalidInput {
        name: name.to_string(),
        message,
    };

    match decl.input_type.as_deref().unwrap_or("string") {
        "boolean" => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid(format!("expected a boolean, got '{}'", raw))),
        },
        "number" => raw
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| invalid(format!("expected a number, got '{}'", raw))),
        "choice" => {
            if decl.options.iter().any(|o| o == raw) {
                Ok(Value::String(raw.to_string()))
            } else {
                Err(invalid(format!(
                    "'{}' is not one of [{}]",
                    raw,
                    decl.options.join(", ")
                )))
            }
        }
        _ => Ok(Value::String(raw.to_string())),
    }
}

fn generate_run_id() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

/// Committed results of finished jobs.
///
/// Each job commits exactly once, after all of its instances are terminal.
/// Readers only ever see committed entries.
#[derive(Debug, Default)]
pub struct OutputsLedger {
    entries: IndexMap<String, JobDependency>,
}

impl OutputsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job's aggregated result. Outputs are kept only for successful jobs.
    pub fn commit(
        &mut self,
        job_id: &str,
        result: Conclusion,
        outputs: IndexMap<String, String>,
    ) -> EngineResult<()> {
        if self.entries.contains_key(job_id) {
            return Err(EngineError::AlreadyCommitted(job_id.to_string()));
        }

        let outputs = if result.is_success() {
            outputs
        } else {
            IndexMap::new()
        };

        self.entries.insert(
            job_id.to_string(),
            JobDependency {
                result: result.as_str().to_string(),
                outputs,
            },
        );
        Ok(())
    }

    pub fn is_committed(&self, job_id: &str) -> bool {
        self.entries.contains_key(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<&JobDependency> {
        self.entries.get(job_id)
    }

    /// The `needs` context for a job: committed entries for its direct dependencies
    pub fn snapshot_for<'a>(
        &self,
        needs: impl IntoIterator<Item = &'a str>,
    ) -> IndexMap<String, JobDependency> {
        needs
            .into_iter()
            .filter_map(|id| self.entries.get(id).map(|dep| (id.to_string(), dep.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parser::WorkflowParser;

    const DISPATCH: &str = r#"
on:
  workflow_dispatch:
    inputs:
      environment:
        type: choice
        required: true
        options: [staging, production]
      dry-run:
        type: boolean
        default: true
      replicas:
        type: number
        default: 2
jobs:
  deploy:
    steps:
      - run: echo ${{ inputs.environment }}
"#;

    fn dispatch(inputs: &[(&str, &str)]) -> EngineResult<RunContext> {
        let workflow = WorkflowParser::parse_and_validate(DISPATCH).unwrap();
        let mut request = RunRequest::new(EventInfo::new("workflow_dispatch")).with_run_id("7");
        for (name, value) in inputs {
            request = request.with_input(*name, *value);
        }
        RunContext::new(&workflow, request, PathBuf::from("/work"))
    }

    #[test]
    fn test_inputs_typed_with_defaults() {
        let ctx = dispatch(&[("environment", "staging")]).unwrap();
        assert_eq!(ctx.inputs["environment"], Value::from("staging"));
        assert_eq!(ctx.inputs["dry-run"], Value::Bool(true));
        assert_eq!(ctx.inputs["replicas"], Value::Number(2.0));
        assert_eq!(ctx.run_id, "7");
        assert_eq!(ctx.github.run_id, "7");
    }

    #[test]
    fn test_missing_required_input() {
        let err = dispatch(&[]).unwrap_err();
        assert!(matches!(err, EngineError::MissingInput(name) if name == "environment"));
    }

    #[test]
    fn test_invalid_inputs() {
        let err = dispatch(&[("environment", "moon")]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));

        let err = dispatch(&[("environment", "staging"), ("dry-run", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("expected a boolean"));

        let ctx = dispatch(&[("environment", "staging"), ("dry-run", "FALSE")]).unwrap();
        assert_eq!(ctx.inputs["dry-run"], Value::Bool(false));
    }

    #[test]
    fn test_push_event_ignores_dispatch_declarations() {
        let workflow = WorkflowParser::parse_and_validate(DISPATCH).unwrap();
        let request = RunRequest::new(EventInfo::new("push").with_ref("refs/heads/main"));
        let ctx = RunContext::new(&workflow, request, PathBuf::from("/work")).unwrap();
        assert!(ctx.inputs.is_empty());
        assert_eq!(ctx.github.ref_name(), "main");
    }

    #[test]
    fn test_expression_context_has_no_job_scope() {
        let ctx = dispatch(&[("environment", "production")]).unwrap();
        let expr = ctx.expression_context();
        assert!(expr.matrix.is_none());
        assert!(expr.steps.is_none());
        assert_eq!(expr.inputs["environment"], Value::from("production"));
    }

    #[test]
    fn test_ledger_is_append_only() {
        let mut ledger = OutputsLedger::new();
        let mut outputs = IndexMap::new();
        outputs.insert("version".to_string(), "1.2.3".to_string());

        ledger.commit("build", Conclusion::Success, outputs.clone()).unwrap();
        assert!(ledger.commit("build", Conclusion::Failure, IndexMap::new()).is_err());
        assert_eq!(ledger.get("build").unwrap().outputs["version"], "1.2.3");
        assert_eq!(ledger.get("build").unwrap().result, "success");

        ledger.commit("lint", Conclusion::Failure, outputs).unwrap();
        assert!(ledger.get("lint").unwrap().outputs.is_empty());

        let needs = ledger.snapshot_for(["build", "test"]);
        assert_eq!(needs.len(), 1);
        assert!(needs.contains_key("build"));
    }
}
