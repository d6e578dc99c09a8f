// Runners Module
// Step execution backends: shell commands for `run`, registered actions for `uses`

pub mod actions;
pub mod shell;

// Re-export key types
pub use actions::{FnAction, NoopAction};
pub use shell::{Shell, ShellRunner};

use crate::error::StepError;
use crate::execution::events::{EventSender, EventSink, ExecutionEvent, LogLevel};

use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A `run:` step ready to execute
#[derive(Debug, Clone)]
pub struct ScriptCall<'a> {
    pub script: &'a str,
    /// Shell name from the step, job/workflow defaults, or the engine config
    pub shell: &'a str,
    pub env: &'a IndexMap<String, String>,
    pub working_dir: &'a Path,
}

/// A `uses:` step ready to execute
#[derive(Debug, Clone)]
pub struct ActionCall<'a> {
    /// Full reference, e.g. `actions/setup-node@v4`
    pub reference: &'a str,
    /// Evaluated `with:` parameters
    pub inputs: &'a IndexMap<String, String>,
    pub env: &'a IndexMap<String, String>,
    pub working_dir: &'a Path,
}

impl ActionCall<'_> {
    /// Reference without the version, e.g. `actions/setup-node`
    pub fn name(&self) -> &str {
        split_reference(self.reference).0
    }

    pub fn version(&self) -> Option<&str> {
        split_reference(self.reference).1
    }

    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).map(String::as_str)
    }
}

fn split_reference(reference: &str) -> (&str, Option<&str>) {
    if reference.starts_with("./") || reference.starts_with("docker://") {
        return (reference, None);
    }
    match reference.rsplit_once('@') {
        Some((name, version)) => (name, Some(version)),
        None => (reference, None),
    }
}

/// Executes `run:` steps
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, call: &ScriptCall<'_>, io: &mut StepIo) -> Result<(), StepError>;
}

/// Executes `uses:` steps. Implementations are opaque to the engine: they
/// report success or an error, and publish outputs through `io`.
#[async_trait::async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(&self, call: &ActionCall<'_>, io: &mut StepIo) -> Result<(), StepError>;
}

/// Channel between a running step and the engine: outputs, log lines and masks
#[derive(Debug)]
pub struct StepIo {
    job: String,
    step_index: usize,
    events: EventSink,
    outputs: IndexMap<String, String>,
}

impl StepIo {
    pub fn new(job: impl Into<String>, step_index: usize, events: EventSink) -> Self {
        Self {
            job: job.into(),
            step_index,
            events,
            outputs: IndexMap::new(),
        }
    }

    /// Record a step output. A later value for the same name replaces the earlier one.
    pub fn set_output(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        self.events.send_event(ExecutionEvent::OutputSet {
            job: self.job.clone(),
            step_index: Some(self.step_index),
            name: name.clone(),
            value: value.clone(),
        });
        self.outputs.insert(name, value);
    }

    /// Emit a line of step output
    pub fn log(&self, line: impl Into<String>) {
        self.events.send_event(ExecutionEvent::step_output(
            &self.job,
            self.step_index,
            line,
            false,
        ));
    }

    /// Emit a line of error output
    pub fn error(&self, line: impl Into<String>) {
        self.events.send_event(ExecutionEvent::step_output(
            &self.job,
            self.step_index,
            line,
            true,
        ));
    }

    /// Emit a debug message
    pub fn debug(&self, message: impl Into<String>) {
        self.events.send_event(ExecutionEvent::log(
            LogLevel::Debug,
            message,
            Some(self.job.clone()),
        ));
    }

    /// Register a value to be masked from now on
    pub fn add_mask(&self, value: &str) {
        self.events.masker().register(value);
    }

    pub fn outputs(&self) -> &IndexMap<String, String> {
        &self.outputs
    }

    pub fn into_outputs(self) -> IndexMap<String, String> {
        self.outputs
    }
}

/// Runner registry for the shell runner and the available actions
#[derive(Clone)]
pub struct RunnerRegistry {
    shell: Arc<dyn CommandRunner>,
    actions: HashMap<String, Arc<dyn ActionRunner>>,
    fallback: Option<Arc<dyn ActionRunner>>,
}

impl RunnerRegistry {
    /// Create a new runner registry with the default shell runner and no actions
    pub fn new() -> Self {
        Self {
            shell: Arc::new(ShellRunner::new()),
            actions: HashMap::new(),
            fallback: None,
        }
    }

    /// Replace the runner used for `run:` steps
    pub fn with_shell_runner(mut self, runner: impl CommandRunner + 'static) -> Self {
        self.shell = Arc::new(runner);
        self
    }

    /// Register an action under a full reference (`owner/name@v1`) or a bare name
    /// (`owner/name`, matching any version)
    pub fn with_action(
        mut self,
        reference: impl Into<String>,
        runner: impl ActionRunner + 'static,
    ) -> Self {
        self.actions.insert(reference.into(), Arc::new(runner));
        self
    }

    /// Runner for references nothing else matches
    pub fn with_fallback(mut self, runner: impl ActionRunner + 'static) -> Self {
        self.fallback = Some(Arc::new(runner));
        self
    }

    pub fn shell(&self) -> &Arc<dyn CommandRunner> {
        &self.shell
    }

    /// Resolve a `uses:` reference: exact match, then name without version, then fallback
    pub fn resolve(&self, reference: &str) -> Result<Arc<dyn ActionRunner>, StepError> {
        self.actions
            .get(reference)
            .or_else(|| self.actions.get(split_reference(reference).0))
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| StepError::action(reference, "no runner registered for this action"))
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&String> = self.actions.keys().collect();
        actions.sort();
        f.debug_struct("RunnerRegistry")
            .field("actions", &actions)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;
    use crate::execution::secrets::SecretMasker;

    #[test]
    fn test_reference_parts() {
        assert_eq!(
            split_reference("actions/checkout@v4"),
            ("actions/checkout", Some("v4"))
        );
        assert_eq!(split_reference("./local/action"), ("./local/action", None));
        assert_eq!(
            split_reference("docker://alpine@sha256:ab"),
            ("docker://alpine@sha256:ab", None)
        );
    }

    #[test]
    fn test_registry_resolution() {
        let registry = RunnerRegistry::new()
            .with_action("actions/checkout", NoopAction)
            .with_action("acme/deploy@v2", NoopAction);

        assert!(registry.resolve("actions/checkout@v4").is_ok());
        assert!(registry.resolve("acme/deploy@v2").is_ok());

        let err = registry.resolve("acme/deploy@v3").err().unwrap();
        assert!(matches!(err, StepError::ActionExecution { .. }));
        assert!(err.to_string().contains("acme/deploy@v3"));

        let registry = registry.with_fallback(NoopAction);
        assert!(registry.resolve("acme/deploy@v3").is_ok());
    }

    #[tokio::test]
    async fn test_step_io_masks_and_collects() {
        let (tx, mut rx) = progress_channel();
        let masker = Arc::new(SecretMasker::default());
        let mut io = StepIo::new("build", 2, EventSink::new(Some(tx), masker));

        io.add_mask("tok3n");
        io.log("using tok3n");
        io.set_output("x", "1");
        io.set_output("x", "5");

        assert_eq!(
            rx.recv().await.unwrap(),
            ExecutionEvent::step_output("build", 2, "using ***", false)
        );
        assert_eq!(io.outputs().len(), 1);
        assert_eq!(io.into_outputs()["x"], "5");
    }

    #[test]
    fn test_action_call_accessors() {
        let inputs: IndexMap<String, String> =
            [("node-version".to_string(), "20".to_string())].into_iter().collect();
        let env = IndexMap::new();
        let call = ActionCall {
            reference: "actions/setup-node@v4",
            inputs: &inputs,
            env: &env,
            working_dir: Path::new("."),
        };
        assert_eq!(call.name(), "actions/setup-node");
        assert_eq!(call.version(), Some("v4"));
        assert_eq!(call.input("node-version"), Some("20"));
    }
}
