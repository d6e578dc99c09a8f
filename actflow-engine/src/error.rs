// Error types for the workflow engine

use std::time::Duration;

use thiserror::Error;

pub use crate::expression::EvalError;

/// Errors raised while loading a workflow document. The run never starts.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("schema error: {message}")]
    Schema { message: String },

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("failed to read workflow: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }
}

impl From<serde_yaml::Error> for WorkflowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::schema(err.to_string())
    }
}

/// Errors that fail a single step. They surface as step status, never as a crash.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("action '{reference}' failed: {message}")]
    ActionExecution { reference: String, message: String },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error(transparent)]
    Expression(#[from] EvalError),

    #[error("cancelled")]
    Cancelled,

    #[error("failed to start process: {0}")]
    Spawn(#[from] std::io::Error),
}

impl StepError {
    pub fn action(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ActionExecution {
            reference: reference.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced synchronously by the engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("invalid value for input '{name}': {message}")]
    InvalidInput { name: String, message: String },

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("results for job '{0}' are already committed")]
    AlreadyCommitted(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
