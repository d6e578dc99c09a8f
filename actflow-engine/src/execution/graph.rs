// Execution Graph (DAG) Builder
// Builds the job DAG from a workflow, with matrix instances stored in an arena

use crate::error::WorkflowError;
use crate::execution::matrix::{MatrixExpander, MatrixInstance};
use crate::workflow::models::{Job, WorkflowDocument};
use crate::workflow::parser::WorkflowParser;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub type JobIndex = usize;
pub type InstanceIndex = usize;

/// Execution graph: one node per job id, one instance per matrix combination
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    jobs: Vec<JobNode>,
    instances: Vec<InstanceNode>,
    /// Quick lookup of job index by id
    job_indices: HashMap<String, JobIndex>,
}

/// A node representing a job in the execution graph
#[derive(Debug, Clone)]
pub struct JobNode {
    pub id: String,
    pub spec: Arc<Job>,
    /// Jobs this job needs, in declaration order
    pub dependencies: Vec<JobIndex>,
    /// Jobs that need this job
    pub dependents: Vec<JobIndex>,
    /// Matrix instances (exactly one for a job without a matrix)
    pub instances: Vec<InstanceIndex>,
}

/// One concrete, schedulable copy of a job
#[derive(Debug, Clone)]
pub struct InstanceNode {
    pub job: JobIndex,
    /// Position among the job's instances
    pub ordinal: usize,
    pub matrix: MatrixInstance,
}

impl ExecutionGraph {
    /// Build an execution graph from a workflow definition
    pub fn from_workflow(workflow: &WorkflowDocument) -> Result<Self, WorkflowError> {
        if let Some(cycle) = WorkflowParser::find_cycle(workflow) {
            return Err(WorkflowError::Cycle { cycle });
        }

        let job_indices: HashMap<String, JobIndex> = workflow
            .jobs
            .keys()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();

        let mut jobs = Vec::with_capacity(workflow.jobs.len());
        let mut instances = Vec::new();

        for (idx, (id, job)) in workflow.jobs.iter().enumerate() {
            let mut dependencies = Vec::new();
            for needed in job.needs.to_vec() {
                let dep = job_indices.get(&needed).copied().ok_or_else(|| {
                    WorkflowError::schema(format!(
                        "job '{}' depends on non-existent job '{}'",
                        id, needed
                    ))
                })?;
                if !dependencies.contains(&dep) {
                    dependencies.push(dep);
                }
            }

            let instance_indices = MatrixExpander::for_job(job)
                .into_iter()
                .enumerate()
                .map(|(ordinal, matrix)| {
                    instances.push(InstanceNode {
                        job: idx,
                        ordinal,
                        matrix,
                    });
                    instances.len() - 1
                })
                .collect();

            jobs.push(JobNode {
                id: id.clone(),
                spec: Arc::new(job.clone()),
                dependencies,
                dependents: Vec::new(),
                instances: instance_indices,
            });
        }

        for idx in 0..jobs.len() {
            for dep in jobs[idx].dependencies.clone() {
                jobs[dep].dependents.push(idx);
            }
        }

        Ok(Self {
            jobs,
            instances,
            job_indices,
        })
    }

    pub fn jobs(&self) -> &[JobNode] {
        &self.jobs
    }

    pub fn job(&self, idx: JobIndex) -> &JobNode {
        &self.jobs[idx]
    }

    pub fn instance(&self, idx: InstanceIndex) -> &InstanceNode {
        &self.instances[idx]
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Get a job by id
    pub fn get(&self, id: &str) -> Option<&JobNode> {
        self.index_of(id).map(|idx| &self.jobs[idx])
    }

    pub fn index_of(&self, id: &str) -> Option<JobIndex> {
        self.job_indices.get(id).copied()
    }

    /// Jobs in a valid dispatch order. Ties go to declaration order.
    pub fn topological_order(&self) -> Vec<JobIndex> {
        // Kahn's algorithm
        let mut in_degree: Vec<usize> = self.jobs.iter().map(|j| j.dependencies.len()).collect();
        let mut ready: BTreeSet<JobIndex> = (0..self.jobs.len())
            .filter(|&idx| in_degree[idx] == 0)
            .collect();

        let mut result = Vec::with_capacity(self.jobs.len());
        while let Some(idx) = ready.pop_first() {
            result.push(idx);
            for &dependent in &self.jobs[idx].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        result
    }

    /// Group jobs into levels that can run in parallel
    pub fn parallel_levels(&self) -> Vec<Vec<JobIndex>> {
        let mut depth = vec![0usize; self.jobs.len()];
        for idx in self.topological_order() {
            depth[idx] = self.jobs[idx]
                .dependencies
                .iter()
                .map(|&dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut levels: Vec<Vec<JobIndex>> = Vec::new();
        for (idx, &level) in depth.iter().enumerate() {
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(idx);
        }
        levels
    }

    /// Every job that transitively depends on `idx`
    pub fn downstream(&self, idx: JobIndex) -> BTreeSet<JobIndex> {
        let mut seen = BTreeSet::new();
        let mut stack = self.jobs[idx].dependents.clone();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.jobs[next].dependents.iter().copied());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(yaml: &str) -> ExecutionGraph {
        let workflow = WorkflowParser::parse(yaml).unwrap();
        ExecutionGraph::from_workflow(&workflow).unwrap()
    }

    fn ids(graph: &ExecutionGraph, order: &[JobIndex]) -> Vec<String> {
        order.iter().map(|&i| graph.job(i).id.clone()).collect()
    }

    const DIAMOND: &str = r#"
on: push
jobs:
  deploy:
    needs: [test, lint]
    steps: [{ run: deploy }]
  test:
    needs: build
    strategy:
      matrix:
        os: [linux, macos]
    steps: [{ run: test }]
  lint:
    needs: build
    steps: [{ run: lint }]
  build:
    steps: [{ run: build }]
"#;

    #[test]
    fn test_topological_order() {
        let graph = graph(DIAMOND);
        let order = graph.topological_order();
        assert_eq!(ids(&graph, &order), vec!["build", "test", "lint", "deploy"]);
    }

    #[test]
    fn test_order_respects_every_edge() {
        let graph = graph(DIAMOND);
        let order = graph.topological_order();
        let position = |idx: JobIndex| order.iter().position(|&i| i == idx).unwrap();
        for (idx, job) in graph.jobs().iter().enumerate() {
            for &dep in &job.dependencies {
                assert!(position(dep) < position(idx));
            }
        }
    }

    #[test]
    fn test_parallel_levels() {
        let graph = graph(DIAMOND);
        let levels: Vec<Vec<String>> = graph
            .parallel_levels()
            .iter()
            .map(|level| ids(&graph, level))
            .collect();
        assert_eq!(levels, vec![vec!["build"], vec!["test", "lint"], vec!["deploy"]]);
    }

    #[test]
    fn test_instances_arena() {
        let graph = graph(DIAMOND);
        assert_eq!(graph.instance_count(), 5);

        let test = graph.get("test").unwrap();
        assert_eq!(test.instances.len(), 2);
        let second = graph.instance(test.instances[1]);
        assert_eq!(second.ordinal, 1);
        assert_eq!(second.matrix.name, "macos");
        assert_eq!(graph.job(second.job).id, "test");
    }

    #[test]
    fn test_downstream() {
        let graph = graph(DIAMOND);
        let build = graph.index_of("build").unwrap();
        let downstream: Vec<String> = graph
            .downstream(build)
            .into_iter()
            .map(|i| graph.job(i).id.clone())
            .collect();
        assert_eq!(downstream, vec!["deploy", "test", "lint"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
on: push
jobs:
  a:
    needs: b
    steps: [{ run: a }]
  b:
    needs: a
    steps: [{ run: b }]
"#;
        let workflow = WorkflowParser::parse(yaml).unwrap();
        let err = ExecutionGraph::from_workflow(&workflow).unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }
}
