//! Trial tracking and tuning run management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use ef_types::{config_error, EfResult};

use crate::search::{ParameterSet, SearchSpace};

/// Unique tuning run identifier.
pub type TuningId = Uuid;

/// Whether the metric is maximized or minimized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    /// Best-fitness style metrics, lower is better.
    #[default]
    Minimize,
}

impl ObjectiveDirection {
    /// Whether `candidate` strictly improves on `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

/// Which search strategy drives a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Grid,
    Random,
}

/// Top-level configuration for a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerConfig {
    pub id: TuningId,
    pub name: String,
    pub search_space: SearchSpace,
    pub strategy: StrategyKind,
    /// Upper bound on evaluated settings.
    pub max_trials: usize,
    pub direction: ObjectiveDirection,
    /// Points per continuous dimension for grid search.
    pub grid_steps: usize,
    /// Seed for random search.
    pub seed: u64,
    pub created_at: DateTime<Utc>,
}

impl TunerConfig {
    pub fn new(name: impl Into<String>, search_space: SearchSpace, strategy: StrategyKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            search_space,
            strategy,
            max_trials: 100,
            direction: ObjectiveDirection::Minimize,
            grid_steps: 5,
            seed: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_max_trials(mut self, n: usize) -> Self {
        self.max_trials = n;
        self
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_grid_steps(mut self, steps: usize) -> Self {
        self.grid_steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> EfResult<()> {
        if self.max_trials == 0 {
            return Err(config_error!("tuning run {} needs max_trials > 0", self.name));
        }
        self.search_space.validate()
    }

    pub fn from_json_str(json: &str) -> EfResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Lifecycle state for a tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TuningState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Aggregate status of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRun {
    pub id: TuningId,
    pub config: TunerConfig,
    pub state: TuningState,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub best_trial: Option<TrialResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TuningRun {
    pub fn new(config: TunerConfig) -> Self {
        Self {
            id: config.id,
            config,
            state: TuningState::Pending,
            trials_completed: 0,
            trials_failed: 0,
            best_trial: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = TuningState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = TuningState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = TuningState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Replace the best trial if `result` strictly improves on it. Earlier
    /// trials win ties; NaN objectives never become best.
    pub fn update_best(&mut self, result: &TrialResult) {
        if result.objective.is_nan() {
            return;
        }
        let better = match &self.best_trial {
            None => true,
            Some(best) => self.config.direction.improves(result.objective, best.objective),
        };
        if better {
            self.best_trial = Some(result.clone());
        }
    }
}

/// One parameter setting evaluated as one instance of a batched call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub tuning_id: TuningId,
    pub trial_number: usize,
    /// Evaluation call this trial was part of.
    pub batch: usize,
    /// Instance index within that call.
    pub instance: usize,
    pub parameters: ParameterSet,
    pub status: TrialStatus,
    pub result: Option<TrialResult>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(tuning_id: TuningId, trial_number: usize, batch: usize, instance: usize, parameters: ParameterSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            tuning_id,
            trial_number,
            batch,
            instance,
            parameters,
            status: TrialStatus::Pending,
            result: None,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TrialStatus::Running;
    }

    pub fn mark_completed(&mut self, result: TrialResult) {
        self.status = TrialStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TrialStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Result of a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: Uuid,
    pub objective: f64,
    /// Any further values the metric carried for this instance.
    pub metrics: BTreeMap<String, f64>,
    pub parameters: ParameterSet,
}
