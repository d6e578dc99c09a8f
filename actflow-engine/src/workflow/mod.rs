pub mod models;
pub mod parser;
pub mod trigger;

pub use models::{
    Concurrency, ContinueOnError, Defaults, Job, JobNeeds, Matrix, Permissions, RunDefaults,
    RunsOn, Step, StepKind, Strategy, WorkflowDocument,
};
pub use parser::{ExpressionIssue, WorkflowParser};
pub use trigger::{
    EventConfig, EventInfo, EventSpec, On, RefFilter, Trigger, WorkflowInput, WorkflowOutput,
    WorkflowSecret,
};
