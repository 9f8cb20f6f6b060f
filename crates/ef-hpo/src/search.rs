//! Search spaces over workflow parameters and the strategies that sample them.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use ef_types::{validation_error, EfResult};

/// One dimension of the search space, addressed by qualified parameter path
/// (e.g. `algorithm.w`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub path: String,
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Sampled uniformly in log-space.
    LogUniform { low: f64, high: f64 },
    Choice { values: Vec<f64> },
}

/// A concrete value produced by a search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
}

impl ParameterValue {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Float(v) => v,
            Self::Int(v) => v as f64,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

/// One suggested setting: a value per parameter path.
pub type ParameterSet = BTreeMap<String, ParameterValue>;

/// Ordered list of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_float(self, path: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(path, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, path: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(path, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, path: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(path, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, path: impl Into<String>, values: Vec<f64>) -> Self {
        self.add(path, ParameterKind::Choice { values })
    }

    fn add(mut self, path: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            path: path.into(),
            kind,
        });
        self
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.path.as_str())
    }

    pub fn validate(&self) -> EfResult<()> {
        if self.parameters.is_empty() {
            return Err(validation_error!("search space is empty"));
        }
        for param in &self.parameters {
            let ok = match &param.kind {
                ParameterKind::FloatRange { low, high } => low <= high,
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => *low > 0.0 && low <= high,
                ParameterKind::Choice { values } => !values.is_empty(),
            };
            if !ok {
                return Err(validation_error!("invalid range for {}: {:?}", param.path, param.kind));
            }
        }
        Ok(())
    }

    /// Number of grid points, `None` when a continuous dimension has no
    /// natural grid.
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.kind {
                ParameterKind::IntRange { low, high } => {
                    usize::try_from(high.checked_sub(*low)?.checked_add(1)?).ok()?
                }
                ParameterKind::Choice { values } => values.len(),
                _ => return None,
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }
}

/// Source of parameter settings for a tuning run.
pub trait SearchStrategy: Send + Sync {
    /// Next batch of at most `count` settings. An empty batch means the
    /// strategy is exhausted.
    fn suggest(&mut self, count: usize) -> Vec<ParameterSet>;

    /// Feed back an observed objective.
    fn report(&mut self, _params: &ParameterSet, _objective: f64) {}

    fn name(&self) -> &str;
}

// ---- Grid search ----

/// Exhaustive walk over the Cartesian product of all dimensions.
#[derive(Debug, Clone)]
pub struct GridSearch {
    cursor: usize,
    combos: Vec<ParameterSet>,
}

impl GridSearch {
    /// Continuous dimensions are split into `float_steps` evenly spaced points.
    pub fn new(space: &SearchSpace, float_steps: usize) -> Self {
        Self {
            cursor: 0,
            combos: Self::build_grid(space, float_steps),
        }
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<ParameterSet> {
        let steps = float_steps.max(2);
        let spaced = |low: f64, high: f64| -> Vec<f64> {
            (0..steps)
                .map(|i| low + (high - low) * i as f64 / (steps - 1) as f64)
                .collect()
        };

        let mut result: Vec<ParameterSet> = vec![BTreeMap::new()];
        for param in &space.parameters {
            let values: Vec<ParameterValue> = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    spaced(*low, *high).into_iter().map(ParameterValue::Float).collect()
                }
                ParameterKind::IntRange { low, high } => (*low..=*high).map(ParameterValue::Int).collect(),
                ParameterKind::LogUniform { low, high } => spaced(low.ln(), high.ln())
                    .into_iter()
                    .map(|v| ParameterValue::Float(v.exp()))
                    .collect(),
                ParameterKind::Choice { values } => values.iter().copied().map(ParameterValue::Float).collect(),
            };
            let mut next = Vec::with_capacity(result.len() * values.len());
            for existing in &result {
                for value in &values {
                    let mut combo = existing.clone();
                    combo.insert(param.path.clone(), *value);
                    next.push(combo);
                }
            }
            result = next;
        }
        result
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParameterSet> {
        let end = (self.cursor + count).min(self.combos.len());
        let batch = self.combos[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent uniform sampling, reproducible from a seed.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn sample_one(&mut self) -> ParameterSet {
        let rng = &mut self.rng;
        self.space
            .parameters
            .iter()
            .map(|param| {
                let value = match &param.kind {
                    ParameterKind::FloatRange { low, high } => ParameterValue::Float(rng.gen_range(*low..=*high)),
                    ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
                    ParameterKind::LogUniform { low, high } => {
                        let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                        ParameterValue::Float(log_val.exp())
                    }
                    ParameterKind::Choice { values } => ParameterValue::Float(values[rng.gen_range(0..values.len())]),
                };
                (param.path.clone(), value)
            })
            .collect()
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<ParameterSet> {
        (0..count).map(|_| self.sample_one()).collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}
