use crate::workflow::trigger::{EventInfo, On, Trigger, WorkflowInput};

use indexmap::IndexMap;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use std::fmt;

/// A workflow definition.
///
/// This represents the top-level structure of a workflow YAML file.
/// Unknown keys are rejected at every level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    /// The name of the workflow
    #[serde(default)]
    pub name: Option<String>,

    /// Display name template for a run
    #[serde(default, rename = "run-name")]
    pub run_name: Option<String>,

    /// The trigger configuration for the workflow
    #[serde(rename = "on")]
    pub on: On,

    /// Workflow-level environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Default settings for all jobs in the workflow
    #[serde(default)]
    pub defaults: Option<Defaults>,

    /// The jobs that make up this workflow, in declaration order
    #[serde(deserialize_with = "unique_jobs")]
    pub jobs: IndexMap<String, Job>,

    /// Token permissions (carried, not enforced)
    #[serde(default)]
    pub permissions: Option<Permissions>,

    /// Concurrency group (carried, not enforced)
    #[serde(default)]
    pub concurrency: Option<Concurrency>,
}

impl WorkflowDocument {
    /// Display name, falling back to `fallback` (usually the file name)
    pub fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(fallback)
    }

    /// Normalized trigger list
    pub fn triggers(&self) -> Vec<Trigger> {
        self.on.triggers()
    }

    /// Whether `event` starts this workflow
    pub fn accepts(&self, event: &EventInfo) -> bool {
        self.triggers().iter().any(|t| t.matches(event))
    }

    /// Input declarations for the given event: `workflow_dispatch` or `workflow_call`
    pub fn input_declarations(&self, event_name: &str) -> IndexMap<String, WorkflowInput> {
        self.triggers()
            .into_iter()
            .find(|t| t.event_name() == event_name)
            .map(|t| t.inputs().clone())
            .unwrap_or_default()
    }
}

// Rejects duplicate job ids instead of letting the later one win
fn unique_jobs<'de, D>(deserializer: D) -> Result<IndexMap<String, Job>, D::Error>
where
    D: Deserializer<'de>,
{
    struct JobsVisitor;

    impl<'de> Visitor<'de> for JobsVisitor {
        type Value = IndexMap<String, Job>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of job ids to jobs")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut jobs = IndexMap::new();
            while let Some(id) = map.next_key::<String>()? {
                if jobs.contains_key(&id) {
                    return Err(de::Error::custom(format!("duplicate job id '{}'", id)));
                }
                let job = map.next_value::<Job>()?;
                jobs.insert(id, job);
            }
            Ok(jobs)
        }
    }

    deserializer.deserialize_map(JobsVisitor)
}

/// Default settings for jobs and steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default)]
    pub run: Option<RunDefaults>,
}

/// Default settings for run steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RunDefaults {
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,
}

/// Permissions configuration for the run token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Permissions {
    /// read-all or write-all
    Level(String),

    /// Per-scope permissions
    Granular(IndexMap<String, String>),
}

/// Concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Concurrency {
    Group(String),

    Detailed {
        group: String,
        #[serde(default, rename = "cancel-in-progress")]
        cancel_in_progress: bool,
    },
}

/// A job within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    /// Display name for the job
    #[serde(default)]
    pub name: Option<String>,

    /// Jobs that must complete before this job runs
    #[serde(default)]
    pub needs: JobNeeds,

    /// Runner requirement tag
    #[serde(default, rename = "runs-on")]
    pub runs_on: Option<RunsOn>,

    /// Conditional expression for job execution
    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Job-level environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Default settings for steps in this job
    #[serde(default)]
    pub defaults: Option<Defaults>,

    /// Declared outputs: name -> expression template
    #[serde(default)]
    pub outputs: IndexMap<String, String>,

    /// Matrix strategy for running multiple job instances
    #[serde(default)]
    pub strategy: Option<Strategy>,

    /// The steps that make up this job
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Service containers (carried, not run)
    #[serde(default)]
    pub services: IndexMap<String, Value>,

    /// Job container (carried, not run)
    #[serde(default)]
    pub container: Option<Value>,

    /// Bound on total step execution, in timeout units
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    /// Whether a failure of this job fails the run
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: ContinueOnError,

    #[serde(default)]
    pub permissions: Option<Permissions>,

    #[serde(default)]
    pub concurrency: Option<Concurrency>,

    /// Deployment environment (carried, not enforced)
    #[serde(default)]
    pub environment: Option<Value>,
}

impl Job {
    /// Effective `defaults.run`, job level over workflow level
    pub fn run_defaults(&self, workflow: Option<&Defaults>) -> RunDefaults {
        let pick = |d: Option<&Defaults>| d.and_then(|d| d.run.clone()).unwrap_or_default();
        let job = pick(self.defaults.as_ref());
        let wf = pick(workflow);
        RunDefaults {
            shell: job.shell.or(wf.shell),
            working_directory: job.working_directory.or(wf.working_directory),
        }
    }
}

/// Job dependencies - can be a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum JobNeeds {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl JobNeeds {
    /// Convert to a vector of job IDs.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            JobNeeds::None => vec![],
            JobNeeds::Single(s) => vec![s.clone()],
            JobNeeds::Multiple(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            JobNeeds::None => true,
            JobNeeds::Single(_) => false,
            JobNeeds::Multiple(v) => v.is_empty(),
        }
    }
}

/// `runs-on`: a label, a list of labels, or a runner group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunsOn {
    /// `runs-on: ubuntu-latest` or `runs-on: ${{ matrix.os }}`
    Label(String),

    /// `runs-on: [self-hosted, linux]`
    Labels(Vec<String>),

    /// `runs-on: { group: ..., labels: [...] }`
    Group {
        group: String,
        #[serde(default)]
        labels: Vec<String>,
    },
}

impl RunsOn {
    pub fn labels(&self) -> Vec<String> {
        match self {
            RunsOn::Label(label) => vec![label.clone()],
            RunsOn::Labels(labels) => labels.clone(),
            RunsOn::Group { group, labels } => {
                std::iter::once(group.clone()).chain(labels.iter().cloned()).collect()
            }
        }
    }
}

/// Continue-on-error setting - a boolean or an expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContinueOnError {
    Bool(bool),
    Expression(String),
}

impl Default for ContinueOnError {
    fn default() -> Self {
        ContinueOnError::Bool(false)
    }
}

/// Strategy configuration for matrix builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: Option<Matrix>,

    /// Cancel not-yet-started sibling instances once one fails
    #[serde(default = "default_fail_fast", rename = "fail-fast")]
    pub fail_fast: bool,

    /// Maximum number of instances running at once
    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<u32>,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            matrix: None,
            fail_fast: true,
            max_parallel: None,
        }
    }
}

fn default_fail_fast() -> bool {
    true
}

/// Matrix axes plus include/exclude adjustments.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Matrix {
    /// Axes in declaration order
    #[serde(flatten)]
    pub dimensions: IndexMap<String, Vec<Value>>,

    #[serde(default)]
    pub include: Vec<IndexMap<String, Value>>,

    #[serde(default)]
    pub exclude: Vec<IndexMap<String, Value>>,
}

/// A step within a job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Identifier used by `steps.<id>` lookups
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, rename = "if")]
    pub if_condition: Option<String>,

    /// Shell script to run
    #[serde(default)]
    pub run: Option<String>,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Action reference, e.g. `actions/checkout@v4`
    #[serde(default)]
    pub uses: Option<String>,

    /// Action parameters
    #[serde(default)]
    pub with: IndexMap<String, String>,

    #[serde(default)]
    pub env: IndexMap<String, String>,

    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: ContinueOnError,

    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,
}

/// What a step executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind<'a> {
    Run(&'a str),
    Uses(&'a str),
}

impl Step {
    /// Get a display name for the step.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(uses) = &self.uses {
            format!("Run {}", uses)
        } else if let Some(run) = &self.run {
            let first_line = run.lines().next().unwrap_or(run);
            if first_line.chars().count() > 50 {
                let head: String = first_line.chars().take(47).collect();
                format!("Run {}...", head)
            } else {
                format!("Run {}", first_line)
            }
        } else {
            "Unnamed step".to_string()
        }
    }

    /// `None` only for documents that failed validation
    pub fn kind(&self) -> Option<StepKind<'_>> {
        match (&self.run, &self.uses) {
            (Some(run), None) => Some(StepKind::Run(run)),
            (None, Some(uses)) => Some(StepKind::Uses(uses)),
            _ => None,
        }
    }
}
