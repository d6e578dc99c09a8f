// Execution Engine Module
// Handles DAG construction, job scheduling, step execution and matrix expansion

pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod matrix;
pub mod results;
pub mod scheduler;
pub mod secrets;

// Re-export key types
pub use context::{OutputsLedger, RunContext, RunRequest};
pub use events::{
    progress_channel, EventSender, EventSink, ExecutionEvent, LogLevel, ProgressReceiver,
    ProgressSender,
};
pub use executor::{JobAssignment, JobExecutor};
pub use graph::{ExecutionGraph, InstanceIndex, InstanceNode, JobIndex, JobNode};
pub use matrix::{MatrixBuilder, MatrixExpander, MatrixInstance};
pub use results::{Conclusion, JobResult, RunResult, StepResult};
pub use scheduler::WorkflowEngine;
pub use secrets::{SecretMasker, DEFAULT_MASK};
