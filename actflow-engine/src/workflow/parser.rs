use crate::error::{EvalError, WorkflowError};
use crate::expression::{extract_expressions, ExpressionEngine, TemplatePart};
use crate::workflow::models::{ContinueOnError, Job, RunsOn, Step, WorkflowDocument};

use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// An expression that failed to compile, with where it was found
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionIssue {
    /// e.g. `jobs.build.steps[2].run`
    pub location: String,
    pub error: EvalError,
}

/// Parser for workflow YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse and validate a workflow from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<WorkflowDocument, WorkflowError> {
        let content = fs::read_to_string(path)?;
        Self::parse_and_validate(&content)
    }

    /// Parse a workflow from a YAML string. Only the schema is checked.
    pub fn parse(content: &str) -> Result<WorkflowDocument, WorkflowError> {
        let workflow: WorkflowDocument = serde_yaml::from_str(content)?;
        Ok(workflow)
    }

    /// Parse and validate a workflow from a YAML string.
    pub fn parse_and_validate(content: &str) -> Result<WorkflowDocument, WorkflowError> {
        let workflow = Self::parse(content)?;
        Self::validate(&workflow)?;
        Ok(workflow)
    }

    /// Validate a parsed workflow for semantic correctness.
    pub fn validate(workflow: &WorkflowDocument) -> Result<(), WorkflowError> {
        if workflow.jobs.is_empty() {
            return Err(WorkflowError::schema("workflow must define at least one job"));
        }

        for (job_id, job) in &workflow.jobs {
            if !is_valid_id(job_id) {
                return Err(WorkflowError::schema(format!(
                    "invalid job id '{}': must start with a letter or '_' and contain only alphanumerics, '-' or '_'",
                    job_id
                )));
            }

            for needed_job in job.needs.to_vec() {
                if !workflow.jobs.contains_key(&needed_job) {
                    return Err(WorkflowError::schema(format!(
                        "job '{}' depends on non-existent job '{}'",
                        job_id, needed_job
                    )));
                }
            }
        }

        if let Some(cycle) = Self::find_cycle(workflow) {
            return Err(WorkflowError::Cycle { cycle });
        }

        for (job_id, job) in &workflow.jobs {
            Self::validate_job(job_id, job)?;
        }

        Ok(())
    }

    fn validate_job(job_id: &str, job: &Job) -> Result<(), WorkflowError> {
        if job.steps.is_empty() {
            return Err(WorkflowError::schema(format!("job '{}' has no steps", job_id)));
        }

        if let Some(minutes) = job.timeout_minutes {
            if minutes <= 0.0 {
                return Err(WorkflowError::schema(format!(
                    "job '{}': timeout-minutes must be positive",
                    job_id
                )));
            }
        }

        if let Some(strategy) = &job.strategy {
            if strategy.max_parallel == Some(0) {
                return Err(WorkflowError::schema(format!(
                    "job '{}': max-parallel must be at least 1",
                    job_id
                )));
            }

            if let Some(matrix) = &strategy.matrix {
                for entry in &matrix.exclude {
                    if let Some(key) = entry.keys().find(|k| !matrix.dimensions.contains_key(*k)) {
                        return Err(WorkflowError::schema(format!(
                            "job '{}': matrix exclude references unknown axis '{}'",
                            job_id, key
                        )));
                    }
                }
            }
        }

        let mut step_ids = HashSet::new();
        for (step_idx, step) in job.steps.iter().enumerate() {
            Self::validate_step(job_id, step_idx, step)?;

            if let Some(id) = &step.id {
                if !step_ids.insert(id.as_str()) {
                    return Err(WorkflowError::schema(format!(
                        "job '{}': duplicate step id '{}'",
                        job_id, id
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_step(job_id: &str, step_idx: usize, step: &Step) -> Result<(), WorkflowError> {
        let step_name = step.name.as_deref().unwrap_or("unnamed");

        match (&step.run, &step.uses) {
            (None, None) => {
                return Err(WorkflowError::schema(format!(
                    "step {} '{}' in job '{}' must have either 'run' or 'uses'",
                    step_idx, step_name, job_id
                )));
            }
            (Some(_), Some(_)) => {
                return Err(WorkflowError::schema(format!(
                    "step {} '{}' in job '{}' cannot have both 'run' and 'uses'",
                    step_idx, step_name, job_id
                )));
            }
            (None, Some(uses)) if !is_valid_uses(uses) => {
                return Err(WorkflowError::schema(format!(
                    "step {} '{}' in job '{}': invalid uses '{}', expected owner/name@ref, ./path or docker://image",
                    step_idx, step_name, job_id, uses
                )));
            }
            _ => {}
        }

        if let Some(id) = &step.id {
            if !is_valid_id(id) {
                return Err(WorkflowError::schema(format!(
                    "job '{}': invalid step id '{}'",
                    job_id, id
                )));
            }
        }

        if let Some(minutes) = step.timeout_minutes {
            if minutes <= 0.0 {
                return Err(WorkflowError::schema(format!(
                    "step {} '{}' in job '{}': timeout-minutes must be positive",
                    step_idx, step_name, job_id
                )));
            }
        }

        Ok(())
    }

    /// Find a dependency cycle in job `needs`.
    ///
    /// Returns the cycle path with the first job repeated at the end,
    /// e.g. `[a, b, a]`. Jobs are visited in declaration order.
    pub fn find_cycle(workflow: &WorkflowDocument) -> Option<Vec<String>> {
        fn visit(
            job_id: &str,
            workflow: &WorkflowDocument,
            visited: &mut HashSet<String>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            if let Some(pos) = path.iter().position(|p| p == job_id) {
                let mut cycle = path[pos..].to_vec();
                cycle.push(job_id.to_string());
                return Some(cycle);
            }
            if visited.contains(job_id) {
                return None;
            }

            path.push(job_id.to_string());
            if let Some(job) = workflow.jobs.get(job_id) {
                for needed_job in job.needs.to_vec() {
                    if let Some(cycle) = visit(&needed_job, workflow, visited, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            visited.insert(job_id.to_string());
            None
        }

        let mut visited = HashSet::new();
        for job_id in workflow.jobs.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = visit(job_id, workflow, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Compile every `${{ }}` block and `if:` condition without evaluating it.
    ///
    /// Syntax errors and unknown functions would otherwise only surface
    /// when the owning step runs.
    pub fn lint_expressions(workflow: &WorkflowDocument) -> Vec<ExpressionIssue> {
        let mut issues = Vec::new();

        if let Some(run_name) = &workflow.run_name {
            lint_template("run-name", run_name, &mut issues);
        }
        for (key, value) in &workflow.env {
            lint_template(&format!("env.{}", key), value, &mut issues);
        }

        for (job_id, job) in &workflow.jobs {
            let prefix = format!("jobs.{}", job_id);

            if let Some(condition) = &job.if_condition {
                lint_condition(&format!("{}.if", prefix), condition, &mut issues);
            }
            if let Some(name) = &job.name {
                lint_template(&format!("{}.name", prefix), name, &mut issues);
            }
            if let Some(RunsOn::Label(label)) = &job.runs_on {
                lint_template(&format!("{}.runs-on", prefix), label, &mut issues);
            }
            if let ContinueOnError::Expression(expr) = &job.continue_on_error {
                lint_template(&format!("{}.continue-on-error", prefix), expr, &mut issues);
            }
            for (key, value) in &job.env {
                lint_template(&format!("{}.env.{}", prefix, key), value, &mut issues);
            }
            for (key, value) in &job.outputs {
                lint_template(&format!("{}.outputs.{}", prefix, key), value, &mut issues);
            }

            for (idx, step) in job.steps.iter().enumerate() {
                let prefix = format!("{}.steps[{}]", prefix, idx);

                if let Some(condition) = &step.if_condition {
                    lint_condition(&format!("{}.if", prefix), condition, &mut issues);
                }
                if let Some(name) = &step.name {
                    lint_template(&format!("{}.name", prefix), name, &mut issues);
                }
                if let Some(run) = &step.run {
                    lint_template(&format!("{}.run", prefix), run, &mut issues);
                }
                if let ContinueOnError::Expression(expr) = &step.continue_on_error {
                    lint_template(&format!("{}.continue-on-error", prefix), expr, &mut issues);
                }
                for (key, value) in &step.with {
                    lint_template(&format!("{}.with.{}", prefix, key), value, &mut issues);
                }
                for (key, value) in &step.env {
                    lint_template(&format!("{}.env.{}", prefix, key), value, &mut issues);
                }
            }
        }

        issues
    }
}

fn lint_template(location: &str, text: &str, issues: &mut Vec<ExpressionIssue>) {
    for part in extract_expressions(text) {
        if let TemplatePart::Expression(body) = part {
            if let Err(error) = ExpressionEngine::compile(&body) {
                issues.push(ExpressionIssue {
                    location: location.to_string(),
                    error,
                });
            }
        }
    }
}

// `if:` accepts a bare expression as well as `${{ }}`
fn lint_condition(location: &str, condition: &str, issues: &mut Vec<ExpressionIssue>) {
    let parts = extract_expressions(condition.trim());
    let bare = matches!(parts.as_slice(), [TemplatePart::Text(_)]);
    if bare {
        if let Err(error) = ExpressionEngine::compile(condition.trim()) {
            issues.push(ExpressionIssue {
                location: location.to_string(),
                error,
            });
        }
    } else {
        lint_template(location, condition, issues);
    }
}

fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_valid_uses(uses: &str) -> bool {
    if uses.starts_with("./") {
        return uses.len() > 2;
    }
    if let Some(image) = uses.strip_prefix("docker://") {
        return !image.is_empty();
    }
    match uses.split_once('@') {
        Some((name, version)) => {
            !name.is_empty() && !version.is_empty() && !name.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo "Hello"
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        assert!(workflow.name.is_none());
        assert!(workflow.jobs.contains_key("build"));
    }

    #[test]
    fn test_schema_error_on_type_mismatch() {
        let yaml = r#"
on: push
jobs:
  build:
    steps: "not a list"
"#;
        let err = WorkflowParser::parse(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::Schema { .. }));
    }

    #[test]
    fn test_validate_missing_dependency() {
        let yaml = r#"
on: push
jobs:
  deploy:
    needs: build
    runs-on: ubuntu-latest
    steps:
      - run: echo "Deploying"
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let result = WorkflowParser::validate(&workflow);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("non-existent job"));
    }

    #[test]
    fn test_validate_circular_dependency() {
        let yaml = r#"
on: push
jobs:
  a:
    needs: c
    runs-on: ubuntu-latest
    steps:
      - run: echo "a"
  b:
    needs: a
    runs-on: ubuntu-latest
    steps:
      - run: echo "b"
  c:
    needs: b
    runs-on: ubuntu-latest
    steps:
      - run: echo "c"
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        match err {
            WorkflowError::Cycle { cycle } => assert_eq!(cycle, vec!["a", "c", "b", "a"]),
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn test_validate_self_dependency() {
        let yaml = r#"
on: push
jobs:
  a:
    needs: a
    steps:
      - run: echo "a"
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        assert_eq!(
            WorkflowParser::find_cycle(&workflow),
            Some(vec!["a".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn test_validate_empty_job() {
        let yaml = r#"
on: push
jobs:
  empty:
    runs-on: ubuntu-latest
    steps: []
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let result = WorkflowParser::validate(&workflow);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("no steps"));
    }

    #[test]
    fn test_validate_no_jobs() {
        let workflow = WorkflowParser::parse("on: push\njobs: {}\n").unwrap();
        assert!(WorkflowParser::validate(&workflow).is_err());
    }

    #[test]
    fn test_validate_step_without_run_or_uses() {
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - name: Invalid step
        env:
          FOO: bar
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let result = WorkflowParser::validate(&workflow);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("must have either 'run' or 'uses'"));
    }

    #[test]
    fn test_validate_step_with_both_run_and_uses() {
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - name: Invalid step
        run: echo "Hello"
        uses: actions/checkout@v4
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let result = WorkflowParser::validate(&workflow);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot have both 'run' and 'uses'"));
    }

    #[test]
    fn test_validate_ids_and_uses() {
        let bad_job_id = "on: push\njobs:\n  1build:\n    steps:\n      - run: x\n";
        assert!(WorkflowParser::parse_and_validate(bad_job_id).is_err());

        let dup_step = r#"
on: push
jobs:
  build:
    steps:
      - id: a
        run: x
      - id: a
        run: y
"#;
        let err = WorkflowParser::parse_and_validate(dup_step).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));

        assert!(is_valid_uses("actions/checkout@v4"));
        assert!(is_valid_uses("./.github/actions/local"));
        assert!(is_valid_uses("docker://alpine:3.19"));
        assert!(!is_valid_uses("actions/checkout"));
        assert!(!is_valid_uses("actions/checkout@"));
    }

    #[test]
    fn test_validate_matrix_exclude_axis() {
        let yaml = r#"
on: push
jobs:
  test:
    strategy:
      matrix:
        os: [a, b]
        exclude:
          - arch: x64
    steps:
      - run: x
"#;
        let err = WorkflowParser::parse_and_validate(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown axis 'arch'"));
    }

    #[test]
    fn test_lint_expressions() {
        let yaml = r#"
on: push
jobs:
  build:
    if: github.ref == 'refs/heads/main' &&
    steps:
      - run: echo ${{ nope(1) }}
      - run: echo ${{ format('{0}', github.sha) }}
        if: ${{ success() }}
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let issues = WorkflowParser::lint_expressions(&workflow);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].location, "jobs.build.if");
        assert!(matches!(issues[0].error, EvalError::Syntax { .. }));
        assert_eq!(issues[1].location, "jobs.build.steps[0].run");
        assert_eq!(issues[1].error, EvalError::UnknownFunction("nope".into()));
    }

    #[test]
    fn test_parse_and_validate_complex_workflow() {
        let yaml = r#"
name: Rust CI

on:
  push:
    branches: [main, develop]
  pull_request:
    branches: [main]

env:
  CARGO_TERM_COLOR: always

jobs:
  check:
    name: Check
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - name: Run check
        run: cargo check --all-features

  test:
    name: Test Suite
    needs: check
    runs-on: ubuntu-latest
    strategy:
      matrix:
        rust: [stable, beta, nightly]
    steps:
      - uses: actions/checkout@v4
      - name: Run tests
        run: cargo test --all-features
        env:
          RUST_BACKTRACE: 1

  fmt:
    name: Rustfmt
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - run: cargo fmt --all -- --check

  deploy:
    name: Deploy
    needs: [test, fmt]
    runs-on: ubuntu-latest
    if: github.ref == 'refs/heads/main'
    steps:
      - uses: actions/checkout@v4
      - name: Deploy
        run: echo "Deploying..."
        env:
          DEPLOY_TOKEN: ${{ secrets.DEPLOY_TOKEN }}
"#;
        let workflow = WorkflowParser::parse_and_validate(yaml).unwrap();
        assert_eq!(workflow.name, Some("Rust CI".to_string()));
        assert_eq!(workflow.jobs.len(), 4);
        assert_eq!(workflow.jobs["deploy"].needs.to_vec(), vec!["test", "fmt"]);
        assert!(WorkflowParser::lint_expressions(&workflow).is_empty());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.yml");
        std::fs::write(&path, "on: push\njobs:\n  a:\n    steps:\n      - run: x\n").unwrap();
        assert!(WorkflowParser::from_file(&path).is_ok());

        let missing = WorkflowParser::from_file(dir.path().join("missing.yml"));
        assert!(matches!(missing, Err(WorkflowError::Io(_))));
    }
}
