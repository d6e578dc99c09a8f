// Execution Results
// Terminal statuses and the per-run result records

use crate::expression::Value;

use indexmap::IndexMap;
use std::fmt;
use std::time::Duration;

/// Terminal status of a step, job or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Cancelled => "cancelled",
            Conclusion::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Conclusion::Success)
    }

    // failure > cancelled > success > skipped
    fn severity(&self) -> u8 {
        match self {
            Conclusion::Failure => 3,
            Conclusion::Cancelled => 2,
            Conclusion::Success => 1,
            Conclusion::Skipped => 0,
        }
    }

    /// Combine the conclusions of a job's matrix instances.
    /// An empty set is `Skipped`.
    pub fn aggregate(conclusions: impl IntoIterator<Item = Conclusion>) -> Conclusion {
        conclusions
            .into_iter()
            .max_by_key(Conclusion::severity)
            .unwrap_or(Conclusion::Skipped)
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    /// Raw result
    pub outcome: Conclusion,
    /// Result after continue-on-error
    pub conclusion: Conclusion,
    pub outputs: IndexMap<String, String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl StepResult {
    pub fn skipped(index: usize, id: Option<String>, name: String) -> Self {
        Self::terminal(index, id, name, Conclusion::Skipped)
    }

    pub fn cancelled(index: usize, id: Option<String>, name: String) -> Self {
        Self::terminal(index, id, name, Conclusion::Cancelled)
    }

    fn terminal(index: usize, id: Option<String>, name: String, status: Conclusion) -> Self {
        Self {
            index,
            id,
            name,
            outcome: status,
            conclusion: status,
            outputs: IndexMap::new(),
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Result of one job instance
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    /// Display name, including the matrix label
    pub name: String,
    pub matrix: IndexMap<String, Value>,
    /// Raw result
    pub outcome: Conclusion,
    /// Result after job-level continue-on-error
    pub conclusion: Conclusion,
    pub outputs: IndexMap<String, String>,
    pub steps: Vec<StepResult>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl JobResult {
    /// A job instance that never ran
    pub fn not_run(
        job_id: impl Into<String>,
        name: impl Into<String>,
        matrix: IndexMap<String, Value>,
        conclusion: Conclusion,
        reason: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            name: name.into(),
            matrix,
            outcome: conclusion,
            conclusion,
            outputs: IndexMap::new(),
            steps: Vec::new(),
            error: reason,
            duration: Duration::ZERO,
        }
    }

    /// Step result by step id
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.id.as_deref() == Some(id))
    }
}

/// Result of a workflow run
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub workflow: String,
    pub status: Conclusion,
    /// One entry per job instance, in completion order
    pub jobs: Vec<JobResult>,
    pub duration: Duration,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// First instance of a job
    pub fn job(&self, id: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.job_id == id)
    }

    /// All instances of a job
    pub fn instances<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a JobResult> + 'a {
        self.jobs.iter().filter(move |j| j.job_id == id)
    }

    /// Aggregated conclusion across a job's instances
    pub fn job_conclusion(&self, id: &str) -> Option<Conclusion> {
        let mut instances = self.instances(id).peekable();
        instances.peek()?;
        Some(Conclusion::aggregate(instances.map(|j| j.conclusion)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_precedence() {
        use Conclusion::*;
        assert_eq!(Conclusion::aggregate([Success, Failure, Cancelled]), Failure);
        assert_eq!(Conclusion::aggregate([Success, Cancelled, Skipped]), Cancelled);
        assert_eq!(Conclusion::aggregate([Skipped, Success]), Success);
        assert_eq!(Conclusion::aggregate([Skipped]), Skipped);
        assert_eq!(Conclusion::aggregate([]), Skipped);
    }

    #[test]
    fn test_run_result_lookup() {
        let run = RunResult {
            run_id: "1".into(),
            workflow: "ci".into(),
            status: Conclusion::Failure,
            jobs: vec![
                JobResult::not_run("test", "test (a)", IndexMap::new(), Conclusion::Success, None),
                JobResult::not_run("test", "test (b)", IndexMap::new(), Conclusion::Failure, None),
            ],
            duration: Duration::ZERO,
        };
        assert_eq!(run.job("test").unwrap().name, "test (a)");
        assert_eq!(run.instances("test").count(), 2);
        assert_eq!(run.job_conclusion("test"), Some(Conclusion::Failure));
        assert_eq!(run.job_conclusion("deploy"), None);
    }
}
