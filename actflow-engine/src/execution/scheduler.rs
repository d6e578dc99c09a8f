// Workflow Scheduler
// Drives the job DAG: promotion, job conditions, dispatch limits, fail-fast and commits

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, WorkflowError};
use crate::execution::context::{OutputsLedger, RunContext, RunRequest};
use crate::execution::events::{EventSender, EventSink, ExecutionEvent, ProgressSender};
use crate::execution::executor::{JobAssignment, JobExecutor};
use crate::execution::graph::{ExecutionGraph, InstanceIndex, JobIndex, JobNode};
use crate::execution::matrix::MatrixInstance;
use crate::execution::results::{Conclusion, JobResult, RunResult};
use crate::execution::secrets::SecretMasker;
use crate::expression::{EvalError, ExpressionEngine, StatusContext, StrategyContext};
use crate::runners::RunnerRegistry;
use crate::workflow::models::WorkflowDocument;
use crate::workflow::parser::WorkflowParser;

use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Runs a validated workflow document
pub struct WorkflowEngine {
    workflow: Arc<WorkflowDocument>,
    graph: ExecutionGraph,
    config: EngineConfig,
    runners: RunnerRegistry,
    progress: Option<ProgressSender>,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    /// Validate a parsed document and build its execution graph
    pub fn new(workflow: WorkflowDocument) -> Result<Self, WorkflowError> {
        WorkflowParser::validate(&workflow)?;
        let graph = ExecutionGraph::from_workflow(&workflow)?;
        Ok(Self {
            workflow: Arc::new(workflow),
            graph,
            config: EngineConfig::default(),
            runners: RunnerRegistry::new(),
            progress: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, WorkflowError> {
        Self::new(WorkflowParser::parse(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WorkflowError> {
        Self::new(WorkflowParser::from_file(path)?)
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_actions(mut self, runners: RunnerRegistry) -> Self {
        self.runners = runners;
        self
    }

    /// Cancelling the token stops the run: pending jobs are cancelled and
    /// running jobs stop at their next step boundary
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn workflow(&self) -> &WorkflowDocument {
        &self.workflow
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Matrix instances a job expands to, in enumeration order
    pub fn instances_of(&self, job_id: &str) -> EngineResult<Vec<&MatrixInstance>> {
        let job = self
            .graph
            .get(job_id)
            .ok_or_else(|| EngineError::UnknownJob(job_id.to_string()))?;
        Ok(job
            .instances
            .iter()
            .map(|idx| &self.graph.instance(*idx).matrix)
            .collect())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the workflow once.
    ///
    /// Fails before any job runs when the request's inputs are invalid.
    /// Everything that goes wrong afterwards is reported in the result.
    #[instrument(skip_all, fields(workflow = %self.workflow.display_name("workflow")))]
    pub async fn run(&self, request: RunRequest) -> EngineResult<RunResult> {
        let start = Instant::now();
        let run = Arc::new(RunContext::new(
            &self.workflow,
            request,
            self.config.workspace(),
        )?);

        let masker = Arc::new(SecretMasker::with_secrets(
            self.config.mask_token.clone(),
            run.secrets.values().map(String::as_str),
        ));
        let events = EventSink::new(self.progress.clone(), masker);
        let cancel = self.cancel.child_token();

        info!(run_id = %run.run_id, jobs = self.graph.jobs().len(), "run_started");
        events.send_event(ExecutionEvent::RunStarted {
            run_id: run.run_id.clone(),
            workflow: run.workflow.clone(),
            total_jobs: self.graph.instance_count(),
        });

        let executor = JobExecutor::new(
            run.clone(),
            self.workflow.defaults.clone(),
            self.runners.clone(),
            Arc::new(self.config.clone()),
            events.clone(),
            cancel.clone(),
        );

        let mut state = RunState::new(&self.graph, &run, &events);
        let mut tasks: JoinSet<JobResult> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, InstanceIndex> = HashMap::new();
        let parallelism = self.config.parallelism();

        loop {
            if cancel.is_cancelled() {
                state.cancel_queued("run cancelled")?;
            }
            state.promote(cancel.is_cancelled())?;

            while tasks.len() < parallelism {
                let Some(instance) = state.next_instance() else {
                    break;
                };
                let assignment = state.assignment(instance);
                debug!(job = %assignment.job_id, instance, "dispatching");
                let executor = executor.clone();
                let handle = tasks.spawn(async move { executor.execute(assignment).await });
                running.insert(handle.id(), instance);
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled(), if !cancel.is_cancelled() => continue,
                joined = tasks.join_next_with_id() => joined,
            };

            let (instance, result) = match joined {
                Some(Ok((id, result))) => match running.remove(&id) {
                    Some(instance) => (instance, result),
                    None => continue,
                },
                Some(Err(e)) => match running.remove(&e.id()) {
                    Some(instance) => {
                        warn!(instance, "job task aborted: {}", e);
                        let result = state.not_run(
                            instance,
                            Conclusion::Failure,
                            format!("job task aborted: {}", e),
                        );
                        (instance, result)
                    }
                    None => continue,
                },
                None => continue,
            };

            state.complete(instance, result)?;
            if state.failed && self.config.cancel_on_failure && !cancel.is_cancelled() {
                info!(run_id = %run.run_id, "cancelling run after job failure");
                cancel.cancel();
            }
        }

        state.settle_remaining()?;

        let status = if self.cancel.is_cancelled() {
            Conclusion::Cancelled
        } else if state
            .results
            .iter()
            .flatten()
            .all(|r| matches!(r.conclusion, Conclusion::Success | Conclusion::Skipped))
        {
            Conclusion::Success
        } else {
            Conclusion::Failure
        };

        let duration = start.elapsed();
        info!(run_id = %run.run_id, status = %status, "run_completed");
        events.send_event(ExecutionEvent::RunCompleted {
            run_id: run.run_id.clone(),
            status,
            duration,
        });

        Ok(RunResult {
            run_id: run.run_id.clone(),
            workflow: run.workflow.clone(),
            status,
            jobs: state.results.into_iter().flatten().collect(),
            duration,
        })
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflow", &self.workflow.display_name("workflow"))
            .field("jobs", &self.graph.jobs().len())
            .field("config", &self.config)
            .field("runners", &self.runners)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for dependencies
    Pending,
    /// Instances queued or running
    Active,
    /// Committed to the ledger
    Done,
}

#[derive(Debug)]
struct JobSlot {
    phase: Phase,
    queue: VecDeque<InstanceIndex>,
    running: usize,
    limit: usize,
}

// Mutable bookkeeping for one run. Only the scheduler loop touches it.
struct RunState<'a> {
    graph: &'a ExecutionGraph,
    run: &'a RunContext,
    events: &'a EventSink,
    order: Vec<JobIndex>,
    slots: Vec<JobSlot>,
    results: Vec<Option<JobResult>>,
    ledger: OutputsLedger,
    failed: bool,
}

impl<'a> RunState<'a> {
    fn new(graph: &'a ExecutionGraph, run: &'a RunContext, events: &'a EventSink) -> Self {
        let slots = graph
            .jobs()
            .iter()
            .map(|job| JobSlot {
                phase: Phase::Pending,
                queue: VecDeque::new(),
                running: 0,
                limit: job
                    .spec
                    .strategy
                    .as_ref()
                    .and_then(|s| s.max_parallel)
                    .map(|n| (n as usize).max(1))
                    .unwrap_or(usize::MAX),
            })
            .collect();

        Self {
            graph,
            run,
            events,
            order: graph.topological_order(),
            slots,
            results: vec![None; graph.instance_count()],
            ledger: OutputsLedger::new(),
            failed: false,
        }
    }

    /// Move jobs whose dependencies are all committed out of `Pending`
    fn promote(&mut self, cancelled: bool) -> EngineResult<()> {
        let graph = self.graph;
        loop {
            let mut progressed = false;

            for idx in self.order.clone() {
                if self.slots[idx].phase != Phase::Pending {
                    continue;
                }
                let node = graph.job(idx);
                let ready = node
                    .dependencies
                    .iter()
                    .all(|dep| self.ledger.is_committed(&graph.job(*dep).id));
                if !ready {
                    continue;
                }
                progressed = true;

                if cancelled {
                    self.settle(idx, Conclusion::Cancelled, "run cancelled")?;
                    continue;
                }

                match self.job_condition(node) {
                    Ok(true) => {
                        let slot = &mut self.slots[idx];
                        slot.phase = Phase::Active;
                        slot.queue = node.instances.iter().copied().collect();
                        if node.instances.is_empty() {
                            self.settle(idx, Conclusion::Skipped, "matrix has no combinations")?;
                        }
                    }
                    Ok(false) => {
                        let reason = self.skip_reason(node);
                        self.settle(idx, Conclusion::Skipped, &reason)?;
                    }
                    Err(e) => {
                        warn!(job = %node.id, "job condition failed to evaluate");
                        let reason = format!("failed to evaluate condition: {}", e);
                        self.events.send_event(ExecutionEvent::error(
                            reason.clone(),
                            Some(node.id.clone()),
                        ));
                        self.settle(idx, Conclusion::Failure, &reason)?;
                    }
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    // Evaluate a job's `if:` against the committed results of its needs
    fn job_condition(&self, node: &JobNode) -> Result<bool, EvalError> {
        let needs = self.ledger.snapshot_for(self.need_ids(node));
        let mut context = self.run.expression_context();
        context.github.job = Some(node.id.clone());
        context.status = StatusContext {
            success: needs.values().all(|n| n.result == Conclusion::Success.as_str()),
            failure: needs.values().any(|n| n.result == Conclusion::Failure.as_str()),
            cancelled: needs.values().any(|n| n.result == Conclusion::Cancelled.as_str()),
        };
        context.needs = needs;
        ExpressionEngine::new(context).evaluate_condition(node.spec.if_condition.as_deref())
    }

    fn skip_reason(&self, node: &JobNode) -> String {
        let unsuccessful = self
            .need_ids(node)
            .into_iter()
            .filter_map(|id| self.ledger.get(id).map(|dep| (id, dep)))
            .find(|(_, dep)| dep.result != Conclusion::Success.as_str());

        match (unsuccessful, &node.spec.if_condition) {
            (Some((id, dep)), None) => format!("dependency '{}' concluded {}", id, dep.result),
            (_, Some(condition)) => format!("condition '{}' evaluated to false", condition),
            (None, None) => "condition evaluated to false".to_string(),
        }
    }

    fn need_ids(&self, node: &JobNode) -> Vec<&'a str> {
        let graph = self.graph;
        node.dependencies
            .iter()
            .map(|dep| graph.job(*dep).id.as_str())
            .collect()
    }

    /// Next instance allowed to start, in topological job order
    fn next_instance(&mut self) -> Option<InstanceIndex> {
        for &idx in &self.order {
            let slot = &mut self.slots[idx];
            if slot.phase != Phase::Active || slot.running >= slot.limit {
                continue;
            }
            if let Some(instance) = slot.queue.pop_front() {
                slot.running += 1;
                return Some(instance);
            }
        }
        None
    }

    fn assignment(&self, instance: InstanceIndex) -> JobAssignment {
        let graph = self.graph;
        let inst = graph.instance(instance);
        let node = graph.job(inst.job);
        let total = node.instances.len();

        JobAssignment {
            job_id: node.id.clone(),
            spec: node.spec.clone(),
            matrix: inst.matrix.clone(),
            needs: self.ledger.snapshot_for(self.need_ids(node)),
            strategy: StrategyContext {
                fail_fast: node.spec.strategy.as_ref().map_or(true, |s| s.fail_fast),
                job_index: inst.ordinal,
                job_total: total,
                max_parallel: self.slots[inst.job].limit.min(total),
            },
        }
    }

    /// Record a finished instance; applies fail-fast and commits the job once settled
    fn complete(&mut self, instance: InstanceIndex, result: JobResult) -> EngineResult<()> {
        let graph = self.graph;
        let job = graph.instance(instance).job;
        let node = graph.job(job);
        let failed = result.conclusion == Conclusion::Failure;
        let name = result.name.clone();

        self.results[instance] = Some(result);
        let slot = &mut self.slots[job];
        slot.running = slot.running.saturating_sub(1);

        let fail_fast = node.spec.strategy.as_ref().map_or(true, |s| s.fail_fast);
        if failed && fail_fast && node.instances.len() > 1 {
            let pending: Vec<InstanceIndex> = self.slots[job].queue.drain(..).collect();
            if !pending.is_empty() {
                info!(job = %node.id, cancelled = pending.len(), "fail-fast");
            }
            for sibling in pending {
                self.record_not_run(
                    sibling,
                    Conclusion::Cancelled,
                    format!("fail-fast: '{}' failed", name),
                );
            }
        }

        self.try_commit(job)
    }

    /// Cancel every queued instance that has not started
    fn cancel_queued(&mut self, reason: &str) -> EngineResult<()> {
        for idx in self.order.clone() {
            if self.slots[idx].phase != Phase::Active {
                continue;
            }
            let pending: Vec<InstanceIndex> = self.slots[idx].queue.drain(..).collect();
            for instance in pending {
                self.record_not_run(instance, Conclusion::Cancelled, reason.to_string());
            }
            self.try_commit(idx)?;
        }
        Ok(())
    }

    /// Conclude a job without running it
    fn settle(&mut self, job: JobIndex, conclusion: Conclusion, reason: &str) -> EngineResult<()> {
        let graph = self.graph;
        self.slots[job].queue.clear();
        self.slots[job].phase = Phase::Active;
        for &instance in &graph.job(job).instances {
            if self.results[instance].is_none() {
                self.record_not_run(instance, conclusion, reason.to_string());
            }
        }
        self.try_commit(job)
    }

    /// Anything left uncommitted when the loop drains is cancelled
    fn settle_remaining(&mut self) -> EngineResult<()> {
        for idx in self.order.clone() {
            if self.slots[idx].phase != Phase::Done {
                self.settle(idx, Conclusion::Cancelled, "run ended before the job could start")?;
            }
        }
        Ok(())
    }

    fn not_run(
        &self,
        instance: InstanceIndex,
        conclusion: Conclusion,
        reason: String,
    ) -> JobResult {
        let inst = self.graph.instance(instance);
        let node = self.graph.job(inst.job);
        let name = match &node.spec.name {
            Some(name) if !inst.matrix.name.is_empty() => {
                format!("{} ({})", name, inst.matrix.name)
            }
            Some(name) => name.clone(),
            None => inst.matrix.display_name(&node.id),
        };
        JobResult::not_run(
            node.id.clone(),
            name,
            inst.matrix.values.clone(),
            conclusion,
            Some(reason),
        )
    }

    fn record_not_run(&mut self, instance: InstanceIndex, conclusion: Conclusion, reason: String) {
        let result = self.not_run(instance, conclusion, reason.clone());
        debug!(job = %result.job_id, conclusion = %conclusion, "job not run");
        self.events.send_event(ExecutionEvent::JobSkipped {
            job_id: result.job_id.clone(),
            job: result.name.clone(),
            conclusion,
            reason,
        });
        self.results[instance] = Some(result);
    }

    // Commit once every instance is terminal. Outputs merge in instance order.
    fn try_commit(&mut self, job: JobIndex) -> EngineResult<()> {
        let graph = self.graph;
        let slot = &self.slots[job];
        if slot.phase != Phase::Active || !slot.queue.is_empty() || slot.running > 0 {
            return Ok(());
        }

        let node = graph.job(job);
        let results: Vec<&JobResult> = node
            .instances
            .iter()
            .filter_map(|i| self.results[*i].as_ref())
            .collect();
        if results.len() < node.instances.len() {
            return Ok(());
        }

        let conclusion = Conclusion::aggregate(results.iter().map(|r| r.conclusion));
        let mut outputs = IndexMap::new();
        for result in &results {
            outputs.extend(result.outputs.clone());
        }

        self.ledger.commit(&node.id, conclusion, outputs)?;
        self.slots[job].phase = Phase::Done;
        if conclusion == Conclusion::Failure {
            self.failed = true;
        }
        info!(job = %node.id, conclusion = %conclusion, "job_committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::runners::{ActionCall, FnAction, StepIo};
    use crate::workflow::trigger::EventInfo;

    fn registry() -> RunnerRegistry {
        RunnerRegistry::new()
            .with_action(
                "test/ok@v1",
                FnAction::new(|call: &ActionCall<'_>, io: &mut StepIo| {
                    for (k, v) in call.inputs {
                        io.set_output(k.clone(), v.clone());
                    }
                    Ok(())
                }),
            )
            .with_action(
                "test/fail@v1",
                FnAction::new(|call: &ActionCall<'_>, _io: &mut StepIo| {
                    Err(StepError::action(call.reference, "failed on purpose"))
                }),
            )
    }

    async fn run(yaml: &str) -> RunResult {
        WorkflowEngine::from_yaml(yaml)
            .unwrap()
            .with_actions(registry())
            .with_config(EngineConfig {
                working_dir: Some(std::env::temp_dir()),
                ..Default::default()
            })
            .run(RunRequest::new(EventInfo::new("push").with_ref("refs/heads/main")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_needs_outputs_flow_downstream() {
        let result = run(r#"
on: push
jobs:
  build:
    outputs:
      version: ${{ steps.v.outputs.version }}
    steps:
      - id: v
        uses: test/ok@v1
        with:
          version: 1.2.3
  deploy:
    needs: build
    steps:
      - id: echo
        uses: test/ok@v1
        with:
          got: ${{ needs.build.outputs.version }}
"#)
        .await;

        assert_eq!(result.status, Conclusion::Success);
        let deploy = result.job("deploy").unwrap();
        assert_eq!(deploy.step("echo").unwrap().outputs["got"], "1.2.3");
    }

    #[tokio::test]
    async fn test_failure_handlers_run_after_failed_dependency() {
        let result = run(r#"
on: push
jobs:
  build:
    steps:
      - uses: test/fail@v1
  notify:
    needs: build
    if: failure()
    steps:
      - uses: test/ok@v1
  report:
    needs: build
    if: always()
    steps:
      - id: r
        uses: test/ok@v1
        with:
          result: ${{ needs.build.result }}
  deploy:
    needs: build
    steps:
      - uses: test/ok@v1
"#)
        .await;

        assert_eq!(result.status, Conclusion::Failure);
        assert_eq!(result.job_conclusion("notify"), Some(Conclusion::Success));
        assert_eq!(
            result.job("report").unwrap().step("r").unwrap().outputs["result"],
            "failure"
        );
        assert_eq!(result.job_conclusion("deploy"), Some(Conclusion::Skipped));
    }

    #[tokio::test]
    async fn test_condition_skip_does_not_fail_run() {
        let result = run(r#"
on: push
jobs:
  release:
    if: github.ref == 'refs/heads/release'
    steps:
      - uses: test/ok@v1
  build:
    steps:
      - uses: test/ok@v1
"#)
        .await;

        assert_eq!(result.status, Conclusion::Success);
        assert_eq!(result.job_conclusion("release"), Some(Conclusion::Skipped));
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_unstarted_siblings() {
        let yaml = r#"
on: push
jobs:
  test:
    strategy:
      max-parallel: 1
      matrix:
        n: [1, 2, 3]
    steps:
      - if: matrix.n == 1
        uses: test/fail@v1
"#;
        let result = run(yaml).await;
        let conclusions: Vec<Conclusion> =
            result.instances("test").map(|j| j.conclusion).collect();
        assert_eq!(
            conclusions,
            vec![Conclusion::Failure, Conclusion::Cancelled, Conclusion::Cancelled]
        );
        assert_eq!(result.job_conclusion("test"), Some(Conclusion::Failure));

        let no_fail_fast =
            yaml.replace("max-parallel: 1", "max-parallel: 1\n      fail-fast: false");
        let result = run(&no_fail_fast).await;
        let conclusions: Vec<Conclusion> =
            result.instances("test").map(|j| j.conclusion).collect();
        assert_eq!(
            conclusions,
            vec![Conclusion::Failure, Conclusion::Success, Conclusion::Success]
        );
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_any_job() {
        let engine = WorkflowEngine::from_yaml(
            r#"
on:
  workflow_dispatch:
    inputs:
      target:
        required: true
jobs:
  build:
    steps:
      - uses: test/ok@v1
"#,
        )
        .unwrap();
        let err = engine.run(RunRequest::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingInput(name) if name == "target"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let yaml = "on: push\njobs:\n  a:\n    steps:\n      - uses: test/ok@v1\n";
        let result = WorkflowEngine::from_yaml(yaml)
            .unwrap()
            .with_actions(registry())
            .with_cancellation(token)
            .run(RunRequest::default())
            .await
            .unwrap();

        assert_eq!(result.status, Conclusion::Cancelled);
        assert_eq!(result.job_conclusion("a"), Some(Conclusion::Cancelled));
    }

    #[test]
    fn test_instances_of() {
        let engine = WorkflowEngine::from_yaml(
            r#"
on: push
jobs:
  t:
    strategy:
      matrix:
        n: [1, 2]
    steps: [{run: echo}]
"#,
        )
        .unwrap();
        let names: Vec<&str> = engine
            .instances_of("t")
            .unwrap()
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(names, vec!["1", "2"]);
        assert!(matches!(
            engine.instances_of("missing"),
            Err(EngineError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_cycle_rejected_at_construction() {
        let err = WorkflowEngine::from_yaml(
            r#"
on: push
jobs:
  a:
    needs: b
    steps: [{run: echo}]
  b:
    needs: a
    steps: [{run: echo}]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Cycle { .. }));
    }
}
