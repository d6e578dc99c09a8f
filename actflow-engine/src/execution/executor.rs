// Job Executor
// Runs one job instance: steps in order, conditions, outputs, continue-on-error and timeouts

use crate::config::EngineConfig;
use crate::error::StepError;
use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, EventSink, ExecutionEvent, LogLevel};
use crate::execution::matrix::MatrixInstance;
use crate::execution::results::{Conclusion, JobResult, StepResult};
use crate::expression::{
    EvalError, ExpressionEngine, JobContext, JobDependency, StatusContext, StepContext,
    StrategyContext,
};
use crate::runners::{ActionCall, RunnerRegistry, ScriptCall, StepIo};
use crate::workflow::models::{ContinueOnError, Defaults, Job, Step, StepKind};

use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One job instance handed to the executor by the scheduler
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub job_id: String,
    pub spec: Arc<Job>,
    pub matrix: MatrixInstance,
    /// Committed results of the job's direct dependencies
    pub needs: IndexMap<String, JobDependency>,
    pub strategy: StrategyContext,
}

/// Executes job instances. Cheap to clone; one clone per running instance.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    run: Arc<RunContext>,
    defaults: Option<Defaults>,
    runners: RunnerRegistry,
    config: Arc<EngineConfig>,
    events: EventSink,
    cancel: CancellationToken,
}

// How a step attempt ended
enum StepRun {
    Finished(Result<(), StepError>),
    JobTimedOut,
}

impl JobExecutor {
    pub fn new(
        run: Arc<RunContext>,
        defaults: Option<Defaults>,
        runners: RunnerRegistry,
        config: Arc<EngineConfig>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run,
            defaults,
            runners,
            config,
            events,
            cancel,
        }
    }

    /// Run every step of a job instance in declared order
    pub async fn execute(&self, assignment: JobAssignment) -> JobResult {
        let start = Instant::now();
        let job = assignment.spec.clone();
        let job_id = assignment.job_id.clone();

        let mut context = self.run.expression_context();
        context.github.job = Some(job_id.clone());
        context.needs = assignment.needs;
        context.matrix = Some(assignment.matrix.values.clone());
        context.strategy = Some(assignment.strategy);
        context.job = Some(JobContext {
            status: Conclusion::Success.as_str().to_string(),
        });
        context.steps = Some(IndexMap::new());
        let mut engine = ExpressionEngine::new(context);

        let name = self
            .events
            .masker()
            .mask(&self.display_name(&engine, &job_id, &job, &assignment.matrix));
        let mut result = JobResult::not_run(
            job_id.clone(),
            name.clone(),
            assignment.matrix.values.clone(),
            Conclusion::Success,
            None,
        );

        if self.cancel.is_cancelled() {
            return self.finish_cancelled(result, &job, 0, "run cancelled", start);
        }

        info!(job = %name, steps = job.steps.len(), "job_started");
        self.events.send_event(ExecutionEvent::JobStarted {
            job_id: job_id.clone(),
            job: name.clone(),
            total_steps: job.steps.len(),
        });

        if let Some(runs_on) = &job.runs_on {
            let labels: Vec<String> = runs_on
                .labels()
                .iter()
                .map(|label| interpolate_or(&engine, Some(label.as_str()), label.clone()))
                .collect();
            self.events.send_event(ExecutionEvent::log(
                LogLevel::Debug,
                format!("runs-on {} (executing on the local machine)", labels.join(", ")),
                Some(name.clone()),
            ));
        }

        let env = match self.job_env(&engine, &job_id, &job) {
            Ok(env) => env,
            Err(e) => {
                result.outcome = Conclusion::Failure;
                result.conclusion = Conclusion::Failure;
                result.error = Some(format!("failed to evaluate job env: {}", e));
                return self.finish(result, start);
            }
        };
        engine.context_mut().env = env;

        let job_coe = continue_on_error(&engine, &job.continue_on_error);
        let deadline = job.timeout_minutes.map(|m| start + self.config.timeout(m));
        let mut job_failed = false;
        let mut rescued_by_job = false;
        let mut run_cancelled = false;

        for (index, step) in job.steps.iter().enumerate() {
            // From here on only steps whose condition opts in still run
            if !run_cancelled && self.cancel.is_cancelled() {
                info!(job = %name, step = index, "run cancelled");
                run_cancelled = true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let message = self.job_timeout_message(&job);
                return self.finish_cancelled(result, &job, index, &message, start);
            }

            {
                let ctx = engine.context_mut();
                ctx.status = StatusContext {
                    success: !job_failed && !run_cancelled,
                    failure: job_failed,
                    cancelled: run_cancelled,
                };
                let status = if run_cancelled {
                    Conclusion::Cancelled
                } else if job_failed {
                    Conclusion::Failure
                } else {
                    Conclusion::Success
                };
                ctx.job = Some(JobContext {
                    status: status.as_str().to_string(),
                });
            }

            let step_name = interpolate_or(&engine, step.name.as_deref(), step.display_name());

            let should_run = match engine.evaluate_condition(step.if_condition.as_deref()) {
                Ok(run) => run,
                Err(e) => {
                    let mut step_result = self.failed_before_start(index, step, step_name, &e);
                    let rescued = self.apply_failure(&engine, step, job_coe, &mut job_failed);
                    rescued_by_job |= rescued == Rescue::Job;
                    if rescued != Rescue::None {
                        step_result.conclusion = Conclusion::Success;
                    }
                    self.emit_step_completed(&name, &step_result);
                    self.record(&mut engine, &mut result, step_result);
                    continue;
                }
            };

            if !should_run && run_cancelled {
                self.events.send_event(ExecutionEvent::StepSkipped {
                    job: name.clone(),
                    step_index: index,
                    step_name: step_name.clone(),
                    reason: "run cancelled".to_string(),
                });
                let cancelled = StepResult::cancelled(index, step.id.clone(), step_name);
                self.record(&mut engine, &mut result, cancelled);
                continue;
            }

            if !should_run {
                debug!(job = %name, step = index, "step skipped by condition");
                self.events.send_event(ExecutionEvent::StepSkipped {
                    job: name.clone(),
                    step_index: index,
                    step_name: step_name.clone(),
                    reason: match &step.if_condition {
                        Some(cond) => format!("condition '{}' evaluated to false", cond),
                        None => "a previous step failed".to_string(),
                    },
                });
                let skipped = StepResult::skipped(index, step.id.clone(), step_name);
                self.record(&mut engine, &mut result, skipped);
                continue;
            }

            self.events.send_event(ExecutionEvent::StepStarted {
                job: name.clone(),
                step_index: index,
                step_name: step_name.clone(),
            });

            let step_start = Instant::now();
            let mut io = StepIo::new(name.clone(), index, self.events.clone());
            let run = self.run_step(&engine, &job, step, &mut io, deadline).await;
            let outputs = io.into_outputs();

            let outcome = match run {
                StepRun::JobTimedOut => {
                    let message = self.job_timeout_message(&job);
                    let mut cancelled = StepResult::cancelled(index, step.id.clone(), step_name);
                    cancelled.error = Some(message.clone());
                    cancelled.outputs = outputs;
                    cancelled.duration = step_start.elapsed();
                    self.emit_step_completed(&name, &cancelled);
                    self.record(&mut engine, &mut result, cancelled);
                    return self.finish_cancelled(result, &job, index + 1, &message, start);
                }
                StepRun::Finished(outcome) => outcome,
            };

            let mut step_result = StepResult {
                index,
                id: step.id.clone(),
                name: step_name,
                outcome: Conclusion::Success,
                conclusion: Conclusion::Success,
                outputs,
                error: None,
                duration: step_start.elapsed(),
            };

            if let Err(e) = outcome {
                warn!(job = %name, step = index, "step failed");
                self.events.send_event(ExecutionEvent::error(
                    format!("step '{}' failed: {}", step_result.name, e),
                    Some(name.clone()),
                ));
                step_result.outcome = Conclusion::Failure;
                step_result.conclusion = Conclusion::Failure;
                step_result.error = Some(e.to_string());
                let rescued = self.apply_failure(&engine, step, job_coe, &mut job_failed);
                rescued_by_job |= rescued == Rescue::Job;
                if rescued != Rescue::None {
                    step_result.conclusion = Conclusion::Success;
                }
            }

            self.emit_step_completed(&name, &step_result);
            self.record(&mut engine, &mut result, step_result);
        }

        if run_cancelled {
            result.outcome = Conclusion::Cancelled;
            result.conclusion = Conclusion::Cancelled;
            result.error = Some("run cancelled".to_string());
            return self.finish(result, start);
        }

        result.outputs = self.job_outputs(&engine, &name, &job);
        result.conclusion = if job_failed {
            Conclusion::Failure
        } else {
            Conclusion::Success
        };
        result.outcome = if job_failed || rescued_by_job {
            Conclusion::Failure
        } else {
            Conclusion::Success
        };
        if job_failed {
            result.error = result
                .steps
                .iter()
                .rev()
                .find(|s| s.conclusion == Conclusion::Failure)
                .and_then(|s| s.error.clone());
        }

        self.finish(result, start)
    }

    async fn run_step(
        &self,
        engine: &ExpressionEngine,
        job: &Job,
        step: &Step,
        io: &mut StepIo,
        deadline: Option<Instant>,
    ) -> StepRun {
        let job_remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let step_limit = step.timeout_minutes.map(|m| self.config.timeout(m));

        let (limit, job_bound) = match (job_remaining, step_limit) {
            (Some(job_left), Some(step_left)) if step_left < job_left => (Some(step_left), false),
            (Some(job_left), _) => (Some(job_left), true),
            (None, step_left) => (step_left, false),
        };

        let invocation = self.invoke(engine, job, step, io);
        match limit {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(outcome) => StepRun::Finished(outcome),
                Err(_) if job_bound => StepRun::JobTimedOut,
                Err(_) => StepRun::Finished(Err(StepError::Timeout { after: limit })),
            },
            None => StepRun::Finished(invocation.await),
        }
    }

    async fn invoke(
        &self,
        engine: &ExpressionEngine,
        job: &Job,
        step: &Step,
        io: &mut StepIo,
    ) -> Result<(), StepError> {
        let mut env = engine.context().env.clone();
        for (key, value) in &step.env {
            env.insert(key.clone(), engine.interpolate(value)?);
        }

        let run_defaults = job.run_defaults(self.defaults.as_ref());
        let working_dir = match step
            .working_directory
            .as_deref()
            .or(run_defaults.working_directory.as_deref())
        {
            Some(dir) => self.run.workspace.join(engine.interpolate(dir)?),
            None => self.run.workspace.clone(),
        };

        match step.kind() {
            Some(StepKind::Run(script)) => {
                let script = engine.interpolate(script)?;
                let shell = step
                    .shell
                    .clone()
                    .or(run_defaults.shell)
                    .unwrap_or_else(|| self.config.default_shell.clone());
                let call = ScriptCall {
                    script: &script,
                    shell: &shell,
                    env: &env,
                    working_dir: &working_dir,
                };
                self.runners.shell().run(&call, io).await
            }
            Some(StepKind::Uses(reference)) => {
                let runner = self.runners.resolve(reference)?;
                let mut inputs = IndexMap::new();
                for (key, value) in &step.with {
                    inputs.insert(key.clone(), engine.interpolate(value)?);
                }
                let call = ActionCall {
                    reference,
                    inputs: &inputs,
                    env: &env,
                    working_dir: &working_dir,
                };
                runner.run(&call, io).await
            }
            None => Err(StepError::action(
                step.display_name(),
                "step must have exactly one of 'run' or 'uses'",
            )),
        }
    }

    // Workflow env, then job env, over the default GITHUB_* variables
    fn job_env(
        &self,
        engine: &ExpressionEngine,
        job_id: &str,
        job: &Job,
    ) -> Result<IndexMap<String, String>, EvalError> {
        let mut env = self.default_env(job_id);
        let mut scoped = ExpressionEngine::new(engine.context().clone());

        for layer in [&self.run.env, &job.env] {
            for (key, value) in layer {
                let value = scoped.interpolate(value)?;
                env.insert(key.clone(), value);
            }
            scoped.context_mut().env = env.clone();
        }

        Ok(env)
    }

    fn default_env(&self, job_id: &str) -> IndexMap<String, String> {
        let github = &self.run.github;
        let mut env = IndexMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("GITHUB_ACTIONS".to_string(), "true".to_string());
        env.insert("GITHUB_WORKFLOW".to_string(), self.run.workflow.clone());
        env.insert("GITHUB_RUN_ID".to_string(), self.run.run_id.clone());
        env.insert("GITHUB_RUN_NUMBER".to_string(), github.run_number.to_string());
        env.insert("GITHUB_JOB".to_string(), job_id.to_string());
        env.insert("GITHUB_EVENT_NAME".to_string(), github.event_name.clone());
        env.insert("GITHUB_REF".to_string(), github.git_ref.clone());
        env.insert("GITHUB_REF_NAME".to_string(), github.ref_name().to_string());
        env.insert("GITHUB_SHA".to_string(), github.sha.clone());
        env.insert("GITHUB_ACTOR".to_string(), github.actor.clone());
        env.insert("GITHUB_REPOSITORY".to_string(), github.repository.clone());
        env.insert(
            "GITHUB_WORKSPACE".to_string(),
            self.run.workspace.to_string_lossy().into_owned(),
        );
        env.insert("RUNNER_OS".to_string(), self.run.runner.os.clone());
        env.insert("RUNNER_ARCH".to_string(), self.run.runner.arch.clone());
        env.insert("RUNNER_TEMP".to_string(), self.run.runner.temp.clone());
        env
    }

    fn display_name(
        &self,
        engine: &ExpressionEngine,
        job_id: &str,
        job: &Job,
        matrix: &MatrixInstance,
    ) -> String {
        match &job.name {
            Some(name) => {
                let rendered = interpolate_or(engine, Some(name.as_str()), name.clone());
                if matrix.name.is_empty() || name.contains("${{") {
                    rendered
                } else {
                    format!("{} ({})", rendered, matrix.name)
                }
            }
            None => matrix.display_name(job_id),
        }
    }

    // Evaluate declared job outputs. Values carrying a secret are dropped.
    fn job_outputs(
        &self,
        engine: &ExpressionEngine,
        name: &str,
        job: &Job,
    ) -> IndexMap<String, String> {
        let mut outputs = IndexMap::new();
        for (key, template) in &job.outputs {
            match engine.interpolate(template) {
                Ok(value) if self.events.masker().contains_secret(&value) => {
                    warn!(job = %name, output = %key, "job output dropped: contains a secret");
                    self.events.send_event(ExecutionEvent::warning(
                        format!("output '{}' was dropped because it contains a secret", key),
                        Some(name.to_string()),
                    ));
                }
                Ok(value) => {
                    self.events.send_event(ExecutionEvent::OutputSet {
                        job: name.to_string(),
                        step_index: None,
                        name: key.clone(),
                        value: value.clone(),
                    });
                    outputs.insert(key.clone(), value);
                }
                Err(e) => {
                    self.events.send_event(ExecutionEvent::warning(
                        format!("failed to evaluate output '{}': {}", key, e),
                        Some(name.to_string()),
                    ));
                }
            }
        }
        outputs
    }

    fn failed_before_start(
        &self,
        index: usize,
        step: &Step,
        step_name: String,
        error: &EvalError,
    ) -> StepResult {
        let message = format!("failed to evaluate condition: {}", error);
        self.events.send_event(ExecutionEvent::error(
            format!("step '{}': {}", step_name, message),
            None,
        ));
        StepResult {
            index,
            id: step.id.clone(),
            name: step_name,
            outcome: Conclusion::Failure,
            conclusion: Conclusion::Failure,
            outputs: IndexMap::new(),
            error: Some(message),
            duration: Duration::ZERO,
        }
    }

    // Decide whether a failed step stops the job
    fn apply_failure(
        &self,
        engine: &ExpressionEngine,
        step: &Step,
        job_coe: bool,
        job_failed: &mut bool,
    ) -> Rescue {
        if continue_on_error(engine, &step.continue_on_error) {
            Rescue::Step
        } else if job_coe {
            Rescue::Job
        } else {
            *job_failed = true;
            Rescue::None
        }
    }

    // Add a step result to the job and expose it as `steps.<id>`
    fn record(
        &self,
        engine: &mut ExpressionEngine,
        result: &mut JobResult,
        step: StepResult,
    ) {
        if let Some(id) = &step.id {
            if let Some(steps) = engine.context_mut().steps.as_mut() {
                steps.insert(
                    id.clone(),
                    StepContext {
                        outputs: step.outputs.clone(),
                        outcome: step.outcome.as_str().to_string(),
                        conclusion: step.conclusion.as_str().to_string(),
                    },
                );
            }
        }
        result.steps.push(step);
    }

    fn emit_step_completed(&self, job: &str, step: &StepResult) {
        self.events.send_event(ExecutionEvent::StepCompleted {
            job: job.to_string(),
            step_index: step.index,
            step_name: step.name.clone(),
            outcome: step.outcome,
            conclusion: step.conclusion,
            duration: step.duration,
        });
    }

    fn job_timeout_message(&self, job: &Job) -> String {
        let limit = self.config.timeout(job.timeout_minutes.unwrap_or_default());
        format!("job exceeded its timeout of {:?}", limit)
    }

    // Mark steps from `from` on as cancelled and conclude the job cancelled
    fn finish_cancelled(
        &self,
        mut result: JobResult,
        job: &Job,
        from: usize,
        reason: &str,
        start: Instant,
    ) -> JobResult {
        for (index, step) in job.steps.iter().enumerate().skip(from) {
            let name = step.name.clone().unwrap_or_else(|| step.display_name());
            result
                .steps
                .push(StepResult::cancelled(index, step.id.clone(), name));
        }
        result.outcome = Conclusion::Cancelled;
        result.conclusion = Conclusion::Cancelled;
        result.outputs.clear();
        result.error = Some(reason.to_string());
        self.finish(result, start)
    }

    fn finish(&self, mut result: JobResult, start: Instant) -> JobResult {
        result.duration = start.elapsed();
        self.redact(&mut result);
        info!(job = %result.name, conclusion = %result.conclusion, "job_completed");
        self.events.send_event(ExecutionEvent::JobCompleted {
            job_id: result.job_id.clone(),
            job: result.name.clone(),
            conclusion: result.conclusion,
            duration: result.duration,
        });
        result
    }

    // Mask every free-text field with the secrets registered so far
    fn redact(&self, result: &mut JobResult) {
        let masker = self.events.masker();
        result.name = masker.mask(&result.name);
        result.error = result.error.as_deref().map(|e| masker.mask(e));
        for value in result.outputs.values_mut() {
            *value = masker.mask(value);
        }
        for step in &mut result.steps {
            step.name = masker.mask(&step.name);
            step.error = step.error.as_deref().map(|e| masker.mask(e));
            for value in step.outputs.values_mut() {
                *value = masker.mask(value);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rescue {
    None,
    Step,
    Job,
}

fn continue_on_error(engine: &ExpressionEngine, setting: &ContinueOnError) -> bool {
    match setting {
        ContinueOnError::Bool(value) => *value,
        ContinueOnError::Expression(expr) => engine
            .evaluate_template(expr)
            .map(|v| v.is_truthy())
            .unwrap_or(false),
    }
}

fn interpolate_or(engine: &ExpressionEngine, text: Option<&str>, fallback: String) -> String {
    text.and_then(|t| engine.interpolate(t).ok())
        .unwrap_or(fallback)
}
