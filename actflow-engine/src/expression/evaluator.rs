// Expression Engine Evaluator
// Evaluates AST expressions against the run, job and step contexts

use crate::expression::functions::BuiltinFunctions;
use crate::expression::lexer::{contains_expression, extract_expressions, TemplatePart};
use crate::expression::parser::{
    BinaryOp, Expr, ExprParser, ParseExprError, Reference, ReferencePart, UnaryOp,
};
use crate::expression::value::Value;

use indexmap::IndexMap;
use thiserror::Error;

use std::cmp::Ordering;
use std::path::PathBuf;

/// Evaluation error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("invalid arguments to {function}(): {message}")]
    InvalidArguments { function: String, message: String },

    #[error("context '{0}' is not available here")]
    UndefinedContext(String),
}

impl EvalError {
    pub fn invalid_args(function: &str, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            function: function.to_string(),
            message: message.into(),
        }
    }
}

impl From<ParseExprError> for EvalError {
    fn from(err: ParseExprError) -> Self {
        Self::Syntax {
            position: err.position,
            message: err.message,
        }
    }
}

/// Context for expression evaluation.
///
/// Scoped contexts (`matrix`, `strategy`, `job`, `steps`) are `None` when the
/// expression is evaluated outside a job; referencing them then is an error.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    pub github: GithubContext,
    pub runner: RunnerContext,
    pub env: IndexMap<String, String>,
    pub vars: IndexMap<String, String>,
    pub secrets: IndexMap<String, String>,
    pub inputs: IndexMap<String, Value>,
    pub needs: IndexMap<String, JobDependency>,
    pub matrix: Option<IndexMap<String, Value>>,
    pub strategy: Option<StrategyContext>,
    pub job: Option<JobContext>,
    pub steps: Option<IndexMap<String, StepContext>>,
    pub status: StatusContext,
    /// Root directory for hashFiles()
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct GithubContext {
    pub event_name: String,
    pub git_ref: String,
    pub sha: String,
    pub actor: String,
    pub repository: String,
    pub run_id: String,
    pub run_number: u64,
    pub workflow: String,
    pub job: Option<String>,
    pub head_ref: String,
    pub base_ref: String,
    pub workspace: String,
    /// Raw event payload
    pub event: serde_json::Value,
}

impl GithubContext {
    /// Short ref name: `main` for `refs/heads/main`
    pub fn ref_name(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .or_else(|| self.git_ref.strip_prefix("refs/tags/"))
            .unwrap_or(&self.git_ref)
    }

    pub fn ref_type(&self) -> &str {
        if self.git_ref.starts_with("refs/tags/") {
            "tag"
        } else {
            "branch"
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunnerContext {
    pub name: String,
    pub os: String,
    pub arch: String,
    pub temp: String,
}

impl RunnerContext {
    /// Describe the machine the engine runs on
    pub fn local() -> Self {
        let os = match std::env::consts::OS {
            "linux" => "Linux",
            "macos" => "macOS",
            "windows" => "Windows",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "X64",
            "x86" => "X86",
            "aarch64" => "ARM64",
            "arm" => "ARM",
            other => other,
        };
        Self {
            name: "local".to_string(),
            os: os.to_string(),
            arch: arch.to_string(),
            temp: std::env::temp_dir().to_string_lossy().into_owned(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StrategyContext {
    pub fail_fast: bool,
    pub job_index: usize,
    pub job_total: usize,
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    /// success, failure or cancelled
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub outputs: IndexMap<String, String>,
    pub outcome: String,
    pub conclusion: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDependency {
    pub result: String,
    pub outputs: IndexMap<String, String>,
}

/// Inputs to the status functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusContext {
    pub success: bool,
    pub failure: bool,
    pub cancelled: bool,
}

impl Default for StatusContext {
    fn default() -> Self {
        Self {
            success: true,
            failure: false,
            cancelled: false,
        }
    }
}

/// Expression evaluator
pub struct Evaluator<'a> {
    context: &'a ExpressionContext,
    functions: BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExpressionContext) -> Self {
        Self {
            context,
            functions: BuiltinFunctions::new(),
        }
    }

    /// Evaluate an expression
    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::FunctionCall { name, args } => self.eval_function(name, args),

            Expr::Reference(_) | Expr::Index { .. } | Expr::Member { .. } | Expr::Filter { .. } => {
                Ok(self.eval_access(expr)?.0)
            }

            Expr::Unary { op, expr } => {
                let val = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!val.is_truthy())),
                }
            }

            // && and || short-circuit and yield the deciding operand
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let left_val = self.eval(left)?;
                    if !left_val.is_truthy() {
                        return Ok(left_val);
                    }
                    self.eval(right)
                }
                BinaryOp::Or => {
                    let left_val = self.eval(left)?;
                    if left_val.is_truthy() {
                        return Ok(left_val);
                    }
                    self.eval(right)
                }
                _ => {
                    let left_val = self.eval(left)?;
                    let right_val = self.eval(right)?;
                    Ok(self.eval_binary(*op, &left_val, &right_val))
                }
            },
        }
    }

    // Returns the value and whether it is the product of an object filter,
    // in which case later accesses map over its elements.
    fn eval_access(&self, expr: &Expr) -> Result<(Value, bool), EvalError> {
        match expr {
            Expr::Reference(reference) => self.eval_reference(reference),
            Expr::Member { object, property } => {
                let (obj, filtered) = self.eval_access(object)?;
                Ok((member(&obj, property, filtered), filtered))
            }
            Expr::Index { object, index } => {
                let (obj, filtered) = self.eval_access(object)?;
                let idx = self.eval(index)?;
                Ok((index_value(&obj, &idx, filtered), filtered))
            }
            Expr::Filter { object } => {
                let (obj, filtered) = self.eval_access(object)?;
                Ok((filter(&obj, filtered), true))
            }
            other => Ok((self.eval(other)?, false)),
        }
    }

    fn eval_reference(&self, reference: &Reference) -> Result<(Value, bool), EvalError> {
        let mut parts = reference.parts.iter();
        let mut current = match parts.next() {
            Some(ReferencePart::Property(name)) => self.lookup_context(name)?,
            _ => return Err(EvalError::UndefinedContext(String::new())),
        };
        let mut filtered = false;

        for part in parts {
            current = match part {
                ReferencePart::Property(name) => member(&current, name, filtered),
                ReferencePart::Index(index_expr) => {
                    let index = self.eval(index_expr)?;
                    index_value(&current, &index, filtered)
                }
                ReferencePart::Wildcard => {
                    let value = filter(&current, filtered);
                    filtered = true;
                    value
                }
            };
        }

        Ok((current, filtered))
    }

    fn lookup_context(&self, name: &str) -> Result<Value, EvalError> {
        let ctx = self.context;
        let scoped = |present: bool, build: &dyn Fn() -> Value| {
            if present {
                Ok(build())
            } else {
                Err(EvalError::UndefinedContext(name.to_string()))
            }
        };

        match name.to_lowercase().as_str() {
            "github" => Ok(self.github_to_value()),
            "runner" => Ok(self.runner_to_value()),
            "env" => Ok(string_map(&ctx.env)),
            "vars" => Ok(string_map(&ctx.vars)),
            "secrets" => Ok(string_map(&ctx.secrets)),
            "inputs" => Ok(Value::Object(ctx.inputs.clone())),
            "needs" => Ok(self.needs_to_value()),
            "matrix" => scoped(ctx.matrix.is_some(), &|| {
                Value::Object(ctx.matrix.clone().unwrap_or_default())
            }),
            "strategy" => scoped(ctx.strategy.is_some(), &|| self.strategy_to_value()),
            "job" => scoped(ctx.job.is_some(), &|| self.job_to_value()),
            "steps" => scoped(ctx.steps.is_some(), &|| self.steps_to_value()),
            _ => Ok(Value::Undefined),
        }
    }

    fn github_to_value(&self) -> Value {
        let github = &self.context.github;
        let mut map = IndexMap::new();
        map.insert("event_name".to_string(), Value::from(github.event_name.as_str()));
        map.insert("ref".to_string(), Value::from(github.git_ref.as_str()));
        map.insert("ref_name".to_string(), Value::from(github.ref_name()));
        map.insert("ref_type".to_string(), Value::from(github.ref_type()));
        map.insert("sha".to_string(), Value::from(github.sha.as_str()));
        map.insert("actor".to_string(), Value::from(github.actor.as_str()));
        map.insert("repository".to_string(), Value::from(github.repository.as_str()));
        map.insert("run_id".to_string(), Value::from(github.run_id.as_str()));
        map.insert(
            "run_number".to_string(),
            Value::Number(github.run_number as f64),
        );
        map.insert("workflow".to_string(), Value::from(github.workflow.as_str()));
        map.insert("head_ref".to_string(), Value::from(github.head_ref.as_str()));
        map.insert("base_ref".to_string(), Value::from(github.base_ref.as_str()));
        map.insert("workspace".to_string(), Value::from(github.workspace.as_str()));
        if let Some(job) = &github.job {
            map.insert("job".to_string(), Value::from(job.as_str()));
        }
        map.insert("event".to_string(), Value::from(&github.event));
        Value::Object(map)
    }

    fn runner_to_value(&self) -> Value {
        let runner = &self.context.runner;
        [
            ("name", &runner.name),
            ("os", &runner.os),
            ("arch", &runner.arch),
            ("temp", &runner.temp),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.as_str()))
        .collect()
    }

    fn strategy_to_value(&self) -> Value {
        let Some(strategy) = &self.context.strategy else {
            return Value::Undefined;
        };

        let mut map = IndexMap::new();
        map.insert("fail-fast".to_string(), Value::Bool(strategy.fail_fast));
        map.insert(
            "job-index".to_string(),
            Value::Number(strategy.job_index as f64),
        );
        map.insert(
            "job-total".to_string(),
            Value::Number(strategy.job_total as f64),
        );
        map.insert(
            "max-parallel".to_string(),
            Value::Number(strategy.max_parallel as f64),
        );
        Value::Object(map)
    }

    fn job_to_value(&self) -> Value {
        let Some(job) = &self.context.job else {
            return Value::Undefined;
        };

        let mut map = IndexMap::new();
        map.insert("status".to_string(), Value::from(job.status.as_str()));
        Value::Object(map)
    }

    fn steps_to_value(&self) -> Value {
        let Some(steps) = &self.context.steps else {
            return Value::Undefined;
        };

        steps
            .iter()
            .map(|(id, step)| {
                let mut map = IndexMap::new();
                map.insert("outputs".to_string(), string_map(&step.outputs));
                map.insert("outcome".to_string(), Value::from(step.outcome.as_str()));
                map.insert(
                    "conclusion".to_string(),
                    Value::from(step.conclusion.as_str()),
                );
                (id.clone(), Value::Object(map))
            })
            .collect()
    }

    fn needs_to_value(&self) -> Value {
        self.context
            .needs
            .iter()
            .map(|(id, dep)| {
                let mut map = IndexMap::new();
                map.insert("result".to_string(), Value::from(dep.result.as_str()));
                map.insert("outputs".to_string(), string_map(&dep.outputs));
                (id.clone(), Value::Object(map))
            })
            .collect()
    }

    fn eval_function(&self, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let evaluated_args: Result<Vec<Value>, EvalError> =
            args.iter().map(|a| self.eval(a)).collect();
        self.functions.call(name, evaluated_args?, self.context)
    }

    fn eval_binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Value {
        let ordering = || left.compare(right);
        let result = match op {
            BinaryOp::Eq => left.loosely_equals(right),
            BinaryOp::Ne => !left.loosely_equals(right),
            BinaryOp::Lt => ordering() == Some(Ordering::Less),
            BinaryOp::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
            BinaryOp::Gt => ordering() == Some(Ordering::Greater),
            BinaryOp::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
            BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit"),
        };
        Value::Bool(result)
    }
}

fn string_map(map: &IndexMap<String, String>) -> Value {
    map.iter().map(|(k, v)| (k.clone(), v.as_str())).collect()
}

fn member(object: &Value, property: &str, filtered: bool) -> Value {
    match object {
        Value::Array(items) if filtered => Value::Array(
            items
                .iter()
                .map(|item| item.get(property))
                .filter(|v| !v.is_undefined())
                .collect(),
        ),
        other => other.get(property),
    }
}

fn index_value(object: &Value, index: &Value, filtered: bool) -> Value {
    match (object, index) {
        (Value::Array(items), _) if filtered => Value::Array(
            items
                .iter()
                .map(|item| index_value(item, index, false))
                .filter(|v| !v.is_undefined())
                .collect(),
        ),
        (Value::Array(items), Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => {
            items.get(*n as usize).cloned().unwrap_or_default()
        }
        (Value::Object(_), Value::String(key)) => object.get(key),
        (Value::Object(_), Value::Number(_)) => object.get(&index.as_string()),
        _ => Value::Undefined,
    }
}

fn filter(object: &Value, filtered: bool) -> Value {
    let spread = |value: &Value| -> Vec<Value> {
        match value {
            Value::Object(map) => map.values().cloned().collect(),
            Value::Array(items) => items.clone(),
            _ => Vec::new(),
        }
    };

    match object {
        Value::Array(items) if filtered => Value::Array(items.iter().flat_map(spread).collect()),
        other => Value::Array(spread(other)),
    }
}

/// High-level expression engine
pub struct ExpressionEngine {
    context: ExpressionContext,
}

impl ExpressionEngine {
    pub fn new(context: ExpressionContext) -> Self {
        Self { context }
    }

    /// Parse an expression body and reject calls to unknown functions
    pub fn compile(source: &str) -> Result<Expr, EvalError> {
        let ast = ExprParser::parse_str(source)?;
        if let Some(unknown) = ast
            .function_names()
            .into_iter()
            .find(|name| !BuiltinFunctions::is_builtin(name))
        {
            return Err(EvalError::UnknownFunction(unknown));
        }
        Ok(ast)
    }

    /// Evaluate an expression body (the text inside `${{ }}`)
    pub fn evaluate(&self, source: &str) -> Result<Value, EvalError> {
        let ast = Self::compile(source)?;
        Evaluator::new(&self.context).eval(&ast)
    }

    /// Replace every `${{ }}` block in `text` with its string value
    pub fn interpolate(&self, text: &str) -> Result<String, EvalError> {
        let mut result = String::with_capacity(text.len());

        for part in extract_expressions(text) {
            match part {
                TemplatePart::Text(s) => result.push_str(&s),
                TemplatePart::Expression(expr) => {
                    result.push_str(&self.evaluate(&expr)?.as_string());
                }
            }
        }

        Ok(result)
    }

    /// Evaluate a template. A lone `${{ expr }}` keeps its typed value,
    /// anything else interpolates to a string.
    pub fn evaluate_template(&self, text: &str) -> Result<Value, EvalError> {
        match single_expression(text) {
            Some(body) => self.evaluate(&body),
            None => Ok(Value::String(self.interpolate(text)?)),
        }
    }

    /// Evaluate an `if:` condition. A missing condition means `success()`.
    /// A condition that calls no status function is implicitly guarded by `success()`.
    pub fn evaluate_condition(&self, condition: Option<&str>) -> Result<bool, EvalError> {
        let Some(condition) = condition.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(self.context.status.success);
        };

        let ast = match single_expression(condition) {
            Some(body) => Self::compile(&body)?,
            None if contains_expression(condition) => {
                // Mixed text and expressions: the condition is the interpolated string
                let text = self.interpolate(condition)?;
                return Ok(self.context.status.success && !text.is_empty());
            }
            None => Self::compile(condition)?,
        };

        let value = Evaluator::new(&self.context).eval(&ast)?;
        if ast.uses_status_function() {
            Ok(value.is_truthy())
        } else {
            Ok(self.context.status.success && value.is_truthy())
        }
    }

    /// Get the context for modification
    pub fn context_mut(&mut self) -> &mut ExpressionContext {
        &mut self.context
    }

    /// Get the context
    pub fn context(&self) -> &ExpressionContext {
        &self.context
    }
}

fn single_expression(text: &str) -> Option<String> {
    let mut parts = extract_expressions(text.trim());
    match (parts.pop(), parts.is_empty()) {
        (Some(TemplatePart::Expression(body)), true) => Some(body),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_context() -> ExpressionContext {
        let mut ctx = ExpressionContext::default();
        ctx.github.event_name = "push".to_string();
        ctx.github.git_ref = "refs/heads/main".to_string();
        ctx.github.event = serde_json::json!({
            "commits": [{"message": "first"}, {"message": "second"}]
        });
        ctx.env.insert("MODE".to_string(), "release".to_string());
        ctx.needs.insert(
            "build".to_string(),
            JobDependency {
                result: "success".to_string(),
                outputs: [("version".to_string(), "1.2.3".to_string())]
                    .into_iter()
                    .collect(),
            },
        );
        ctx.needs.insert(
            "lint".to_string(),
            JobDependency {
                result: "failure".to_string(),
                outputs: IndexMap::new(),
            },
        );
        ctx
    }

    fn eval(expr: &str) -> Value {
        ExpressionEngine::new(make_context()).evaluate(expr).unwrap()
    }

    #[test]
    fn test_eval_literals() {
        assert_eq!(eval("null"), Value::Null);
        assert_eq!(eval("true"), Value::Bool(true));
        assert_eq!(eval("42"), Value::Number(42.0));
        assert_eq!(eval("'hello'"), Value::String("hello".to_string()));
    }

    #[test]
    fn test_eval_context_reference() {
        assert_eq!(eval("github.ref"), Value::from("refs/heads/main"));
        assert_eq!(eval("github.ref_name"), Value::from("main"));
        assert_eq!(eval("GITHUB.EVENT_NAME"), Value::from("push"));
        assert_eq!(eval("needs.build.outputs.version"), Value::from("1.2.3"));
        assert_eq!(eval("env['MODE']"), Value::from("release"));
    }

    #[test]
    fn test_missing_key_is_undefined() {
        assert_eq!(eval("needs.build.outputs.missing"), Value::Undefined);
        assert_eq!(eval("nothing.at.all"), Value::Undefined);
        assert_eq!(eval("needs.build.outputs.missing == ''"), Value::Bool(true));
    }

    #[test]
    fn test_scoped_context_outside_job() {
        let engine = ExpressionEngine::new(make_context());
        let err = engine.evaluate("steps.build.outputs.x").unwrap_err();
        assert_eq!(err, EvalError::UndefinedContext("steps".to_string()));
        assert!(engine.evaluate("matrix.os").is_err());
    }

    #[test]
    fn test_object_filter() {
        assert_eq!(
            eval("github.event.commits.*.message"),
            Value::Array(vec![Value::from("first"), Value::from("second")])
        );
        assert_eq!(
            eval("contains(needs.*.result, 'failure')"),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_logical_operators_yield_operands() {
        assert_eq!(eval("env.MISSING || 'fallback'"), Value::from("fallback"));
        assert_eq!(eval("env.MODE && 'yes'"), Value::from("yes"));
        assert_eq!(eval("'' && 'yes'"), Value::from(""));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("1 < 2"), Value::Bool(true));
        assert_eq!(eval("'10' > 9"), Value::Bool(true));
        assert_eq!(eval("'ABC' == 'abc'"), Value::Bool(true));
        assert_eq!(eval("github.event >= 1"), Value::Bool(false));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval("false && steps.a.outputs.b"), Value::Bool(false));
    }

    #[test]
    fn test_unknown_function() {
        let engine = ExpressionEngine::new(make_context());
        assert_eq!(
            engine.evaluate("false && frobnicate()").unwrap_err(),
            EvalError::UnknownFunction("frobnicate".to_string())
        );
    }

    #[test]
    fn test_syntax_error() {
        let engine = ExpressionEngine::new(make_context());
        assert!(matches!(
            engine.evaluate("github.ref ==").unwrap_err(),
            EvalError::Syntax { .. }
        ));
    }

    #[test]
    fn test_interpolate() {
        let engine = ExpressionEngine::new(make_context());
        assert_eq!(
            engine
                .interpolate("v${{ needs.build.outputs.version }} on ${{ github.ref_name }}")
                .unwrap(),
            "v1.2.3 on main"
        );
        assert_eq!(engine.interpolate("plain").unwrap(), "plain");
    }

    #[test]
    fn test_evaluate_template_keeps_type() {
        let engine = ExpressionEngine::new(make_context());
        assert_eq!(
            engine.evaluate_template("${{ 1 == 1 }}").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            engine.evaluate_template("x ${{ 1 == 1 }}").unwrap(),
            Value::from("x true")
        );
    }

    #[test]
    fn test_condition_implicit_success() {
        let mut engine = ExpressionEngine::new(make_context());
        assert!(engine.evaluate_condition(None).unwrap());
        assert!(engine
            .evaluate_condition(Some("github.ref == 'refs/heads/main'"))
            .unwrap());
        assert!(engine
            .evaluate_condition(Some("${{ github.event_name == 'push' }}"))
            .unwrap());

        engine.context_mut().status = StatusContext {
            success: false,
            failure: true,
            cancelled: false,
        };
        assert!(!engine.evaluate_condition(None).unwrap());
        assert!(!engine
            .evaluate_condition(Some("github.ref == 'refs/heads/main'"))
            .unwrap());
        assert!(engine.evaluate_condition(Some("failure()")).unwrap());
        assert!(engine.evaluate_condition(Some("always()")).unwrap());
    }
}
