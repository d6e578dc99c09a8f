// Execution Events
// Progress reporting and event types for workflow runs

use crate::execution::results::Conclusion;
use crate::execution::secrets::SecretMasker;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a workflow run.
///
/// `job` fields carry the instance display name, e.g. `test (linux, 20)`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: String,
        workflow: String,
        total_jobs: usize,
    },

    RunCompleted {
        run_id: String,
        status: Conclusion,
        duration: Duration,
    },

    JobStarted {
        job_id: String,
        job: String,
        total_steps: usize,
    },

    JobCompleted {
        job_id: String,
        job: String,
        conclusion: Conclusion,
        duration: Duration,
    },

    /// Job never ran: condition false, dependency failed, or run cancelled
    JobSkipped {
        job_id: String,
        job: String,
        conclusion: Conclusion,
        reason: String,
    },

    StepStarted {
        job: String,
        step_index: usize,
        step_name: String,
    },

    /// One line of step output (stdout/stderr)
    StepOutput {
        job: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    StepCompleted {
        job: String,
        step_index: usize,
        step_name: String,
        outcome: Conclusion,
        conclusion: Conclusion,
        duration: Duration,
    },

    StepSkipped {
        job: String,
        step_index: usize,
        step_name: String,
        reason: String,
    },

    /// A step or job output was recorded
    OutputSet {
        job: String,
        step_index: Option<usize>,
        name: String,
        value: String,
    },

    Log {
        level: LogLevel,
        message: String,
        job: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create a step output event
    pub fn step_output(
        job: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            job: job.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    /// Create a log event
    pub fn log(level: LogLevel, message: impl Into<String>, job: Option<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
            job,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job: Option<String>) -> Self {
        Self::log(LogLevel::Warning, message, job)
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job: Option<String>) -> Self {
        Self::log(LogLevel::Error, message, job)
    }

    /// Mask secret values in every free-text field
    pub fn redact(self, masker: &SecretMasker) -> Self {
        match self {
            Self::JobSkipped {
                job_id,
                job,
                conclusion,
                reason,
            } => Self::JobSkipped {
                job_id,
                job: masker.mask(&job),
                conclusion,
                reason: masker.mask(&reason),
            },
            Self::JobStarted {
                job_id,
                job,
                total_steps,
            } => Self::JobStarted {
                job_id,
                job: masker.mask(&job),
                total_steps,
            },
            Self::JobCompleted {
                job_id,
                job,
                conclusion,
                duration,
            } => Self::JobCompleted {
                job_id,
                job: masker.mask(&job),
                conclusion,
                duration,
            },
            Self::StepStarted {
                job,
                step_index,
                step_name,
            } => Self::StepStarted {
                job: masker.mask(&job),
                step_index,
                step_name: masker.mask(&step_name),
            },
            Self::StepOutput {
                job,
                step_index,
                output,
                is_error,
            } => Self::StepOutput {
                job: masker.mask(&job),
                step_index,
                output: masker.mask(&output),
                is_error,
            },
            Self::StepCompleted {
                job,
                step_index,
                step_name,
                outcome,
                conclusion,
                duration,
            } => Self::StepCompleted {
                job: masker.mask(&job),
                step_index,
                step_name: masker.mask(&step_name),
                outcome,
                conclusion,
                duration,
            },
            Self::StepSkipped {
                job,
                step_index,
                step_name,
                reason,
            } => Self::StepSkipped {
                job: masker.mask(&job),
                step_index,
                step_name: masker.mask(&step_name),
                reason: masker.mask(&reason),
            },
            Self::OutputSet {
                job,
                step_index,
                name,
                value,
            } => Self::OutputSet {
                job: masker.mask(&job),
                step_index,
                name,
                value: masker.mask(&value),
            },
            Self::Log {
                level,
                message,
                job,
            } => Self::Log {
                level,
                message: masker.mask(&message),
                job: job.map(|j| masker.mask(&j)),
            },
            event @ (Self::RunStarted { .. } | Self::RunCompleted { .. }) => event,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

/// Event stream of one run. Every event is redacted before it leaves the engine.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Option<ProgressSender>,
    masker: Arc<SecretMasker>,
}

impl EventSink {
    pub fn new(sender: Option<ProgressSender>, masker: Arc<SecretMasker>) -> Self {
        Self { sender, masker }
    }

    pub fn masker(&self) -> &Arc<SecretMasker> {
        &self.masker
    }
}

impl EventSender for EventSink {
    fn send_event(&self, event: ExecutionEvent) {
        if self.sender.is_some() {
            self.sender.send_event(event.redact(&self.masker));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::RunStarted {
            run_id: "1".into(),
            workflow: "ci".into(),
            total_jobs: 2,
        });
        tx.send_event(ExecutionEvent::warning("careful", None));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::RunStarted { .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(
            event2,
            ExecutionEvent::Log {
                level: LogLevel::Warning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sink_redacts_at_emission() {
        let (tx, mut rx) = progress_channel();
        let masker = Arc::new(SecretMasker::with_secrets("***", ["s3cr3t"]));
        let sink = EventSink::new(Some(tx), masker.clone());

        sink.send_event(ExecutionEvent::step_output("build", 0, "token is s3cr3t", false));
        masker.register("later");
        sink.send_event(ExecutionEvent::error("failed with later", Some("build".into())));

        assert_eq!(
            rx.recv().await.unwrap(),
            ExecutionEvent::step_output("build", 0, "token is ***", false)
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ExecutionEvent::error("failed with ***", Some("build".into()))
        );
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::warning("test", None));

        let sink = EventSink::new(None, Arc::new(SecretMasker::default()));
        sink.send_event(ExecutionEvent::warning("test", None));
    }
}
