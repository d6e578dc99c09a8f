// Workflow Engine Library
// Parses workflow documents and runs their jobs: triggers, matrices, the job DAG and steps

pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod runners;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, StepError, WorkflowError};

// Re-export workflow types
pub use workflow::{EventInfo, Job, Step, Trigger, WorkflowDocument, WorkflowParser};

// Re-export expression types
pub use expression::{EvalError, ExpressionContext, ExpressionEngine, Value};

// Re-export execution types
pub use execution::{
    progress_channel, Conclusion, ExecutionEvent, ExecutionGraph, JobResult, MatrixExpander,
    MatrixInstance, ProgressReceiver, ProgressSender, RunRequest, RunResult, SecretMasker,
    StepResult, WorkflowEngine,
};

// Re-export runner types
pub use runners::{
    ActionCall, ActionRunner, CommandRunner, FnAction, NoopAction, RunnerRegistry, ScriptCall,
    ShellRunner, StepIo,
};
