// Matrix Strategy Expansion
// Expands matrix strategies into concrete job instances

use crate::expression::Value;
use crate::workflow::models::{Job, Matrix};

use indexmap::IndexMap;

/// A single matrix instance (one combination of matrix values)
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixInstance {
    /// Display label, e.g. `ubuntu, 20`. Empty when the job has no matrix.
    pub name: String,
    /// Axis values in axis order, followed by include extras
    pub values: IndexMap<String, Value>,
}

impl MatrixInstance {
    fn new(values: IndexMap<String, Value>) -> Self {
        let name = values
            .values()
            .map(|v| {
                if v.is_primitive() {
                    v.as_string()
                } else {
                    v.to_json_string()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        Self { name, values }
    }

    /// `build (ubuntu, 20)` for matrixed jobs, `build` otherwise
    pub fn display_name(&self, job_id: &str) -> String {
        if self.name.is_empty() {
            job_id.to_string()
        } else {
            format!("{} ({})", job_id, self.name)
        }
    }
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Instances of a job: its expanded matrix, or one empty instance without one
    pub fn for_job(job: &Job) -> Vec<MatrixInstance> {
        match job.strategy.as_ref().and_then(|s| s.matrix.as_ref()) {
            Some(matrix) => Self::expand(matrix),
            None => vec![MatrixInstance::new(IndexMap::new())],
        }
    }

    /// Expand a matrix into instances.
    ///
    /// Enumeration follows axis declaration order with the last axis varying
    /// fastest. Excludes drop every combination matching all of their keys.
    /// Each include either extends the combinations whose original axis values
    /// it agrees with, or is appended as a standalone combination.
    pub fn expand(matrix: &Matrix) -> Vec<MatrixInstance> {
        let mut combinations = if matrix.dimensions.is_empty() {
            Vec::new()
        } else {
            Self::cartesian_product(&matrix.dimensions)
        };

        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|entry| Self::matches_all(combo, entry))
        });

        let originals = combinations.len();
        let mut extras: Vec<IndexMap<String, Value>> = Vec::new();

        for entry in &matrix.include {
            let entry: IndexMap<String, Value> =
                entry.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect();
            let mut merged = false;

            for combo in combinations.iter_mut().take(originals) {
                let agrees = entry
                    .iter()
                    .filter(|(k, _)| matrix.dimensions.contains_key(*k))
                    .all(|(k, v)| combo.get(k).is_some_and(|c| same_value(c, v)));
                if !agrees {
                    continue;
                }

                for (key, value) in &entry {
                    if !matrix.dimensions.contains_key(key) {
                        combo.insert(key.clone(), value.clone());
                    }
                }
                merged = true;
            }

            if !merged {
                extras.push(entry);
            }
        }

        combinations.extend(extras);

        if combinations.is_empty() && matrix.dimensions.is_empty() {
            // No axes and no includes: a single default combination
            return vec![MatrixInstance::new(IndexMap::new())];
        }

        combinations.into_iter().map(MatrixInstance::new).collect()
    }

    fn cartesian_product(
        dimensions: &IndexMap<String, Vec<serde_json::Value>>,
    ) -> Vec<IndexMap<String, Value>> {
        let mut combinations = vec![IndexMap::new()];

        for (axis, values) in dimensions {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combo in &combinations {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(axis.clone(), Value::from(value));
                    next.push(extended);
                }
            }
            combinations = next;
        }

        combinations
    }

    fn matches_all(
        combo: &IndexMap<String, Value>,
        entry: &IndexMap<String, serde_json::Value>,
    ) -> bool {
        entry.iter().all(|(key, expected)| {
            combo
                .get(key)
                .is_some_and(|actual| same_value(actual, &Value::from(expected)))
        })
    }
}

// `1` in YAML and `'1'` match; string case is significant
fn same_value(a: &Value, b: &Value) -> bool {
    a == b || (a.is_primitive() && b.is_primitive() && a.as_string() == b.as_string())
}

/// Builder for creating matrix configurations programmatically
#[derive(Debug, Default)]
pub struct MatrixBuilder {
    matrix: Matrix,
}

impl MatrixBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an axis with its values
    pub fn axis<V: Into<serde_json::Value>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.matrix
            .dimensions
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn include<V: Into<serde_json::Value>>(
        mut self,
        entry: impl IntoIterator<Item = (&'static str, V)>,
    ) -> Self {
        self.matrix.include.push(Self::entry(entry));
        self
    }

    pub fn exclude<V: Into<serde_json::Value>>(
        mut self,
        entry: impl IntoIterator<Item = (&'static str, V)>,
    ) -> Self {
        self.matrix.exclude.push(Self::entry(entry));
        self
    }

    pub fn build(self) -> Matrix {
        self.matrix
    }

    fn entry<V: Into<serde_json::Value>>(
        entry: impl IntoIterator<Item = (&'static str, V)>,
    ) -> IndexMap<String, serde_json::Value> {
        entry
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.into()))
            .collect()
    }
}
