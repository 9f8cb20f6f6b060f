//! Evaluation monitor: tracks best-so-far fitness across generations.
//!
//! All tracked values live in the monitor's own local state, so they are
//! batched, checkpointed and replayed together with the rest of the workflow.
//! Events are a side channel and are not part of the state.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ef_types::{
    argmin_first, as_matrix, as_vector, full, scalar, scalar_value, Candidates, EfResult, Hook, HookContext,
    HookSet, LocalState, Module, Monitor, NodeContext, Rng, Schema, StructureError, Tensor,
};
use ndarray::Axis;

use crate::events::{EventLevel, MonitorEvent, MonitorEventKind};

pub const BEST_FITNESS: &str = "best_fitness";
pub const BEST_SOLUTION: &str = "best_solution";
pub const EVALUATIONS: &str = "evaluations";
pub const STAGNATION: &str = "stagnation";
pub const HISTORY: &str = "history";
pub const LATEST_CANDIDATES: &str = "latest_candidates";

/// Configuration for the evaluation monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMonitorConfig {
    /// Width of dense candidates. Enables tracking of the best solution.
    pub solution_dim: Option<usize>,
    /// `(pop_size, dim)` of dense candidates. Enables recording the latest batch.
    pub candidate_shape: Option<(usize, usize)>,
    /// Length of the best-fitness history window. `0` disables it.
    pub history_len: usize,
    /// Emit a stagnation event after this many generations without improvement.
    pub stagnation_window: Option<u64>,
}

impl EvalMonitorConfig {
    pub fn with_solution_dim(mut self, dim: usize) -> Self {
        self.solution_dim = Some(dim);
        self
    }

    pub fn with_candidate_shape(mut self, pop_size: usize, dim: usize) -> Self {
        self.candidate_shape = Some((pop_size, dim));
        self
    }

    pub fn with_history(mut self, len: usize) -> Self {
        self.history_len = len;
        self
    }

    pub fn with_stagnation_window(mut self, generations: u64) -> Self {
        self.stagnation_window = Some(generations);
        self
    }
}

/// Monitor recording the best fitness (and optionally solution) seen so far.
///
/// Single-objective fitness only contributes to the best; NaN values are
/// ignored and ties keep the earliest candidate. Multi-objective fitness is
/// counted but not ranked.
pub struct EvalMonitor {
    config: EvalMonitorConfig,
    events: Option<Sender<MonitorEvent>>,
}

impl EvalMonitor {
    pub fn new() -> Self {
        Self::with_config(EvalMonitorConfig::default())
    }

    pub fn with_config(config: EvalMonitorConfig) -> Self {
        Self { config, events: None }
    }

    /// Send events to `tx`. Sending is best effort.
    pub fn with_events(mut self, tx: Sender<MonitorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &EvalMonitorConfig {
        &self.config
    }

    pub fn best_fitness(local: &LocalState) -> EfResult<f64> {
        scalar_value(local.tensor(BEST_FITNESS)?)
    }

    pub fn evaluations(local: &LocalState) -> EfResult<u64> {
        Ok(scalar_value(local.tensor(EVALUATIONS)?)? as u64)
    }

    /// Best solution, when tracking is enabled.
    pub fn best_solution(local: &LocalState) -> Option<&Tensor> {
        local.get(BEST_SOLUTION).and_then(|v| v.as_tensor())
    }

    fn emit(&self, ctx: &HookContext<'_>, level: EventLevel, kind: MonitorEventKind) {
        let event = MonitorEvent::new(level, kind, ctx.node.display_path(), ctx.generation, ctx.lane);
        match level {
            EventLevel::Warning => warn!(monitor = %event.monitor, lane = event.lane, "{}", event.message),
            EventLevel::Info => info!(monitor = %event.monitor, lane = event.lane, "{}", event.message),
        }
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    fn record_single_objective(
        &self,
        ctx: &HookContext<'_>,
        local: &mut LocalState,
        candidates: &Candidates,
        fitness: &Tensor,
    ) -> EfResult<()> {
        let values = as_vector(fitness, "fitness")?;
        let previous = scalar_value(local.tensor(BEST_FITNESS)?)?;
        let improved = match argmin_first(values) {
            Some(idx) if values[idx] < previous => {
                local.insert(BEST_FITNESS, scalar(values[idx]));
                if let Some(dim) = self.config.solution_dim {
                    let batch = as_matrix(candidates.as_dense()?, "candidates")?;
                    if batch.ncols() != dim {
                        return Err(StructureError::ShapeMismatch {
                            context: "best solution".into(),
                            expected: vec![dim],
                            actual: vec![batch.ncols()],
                        }
                        .into());
                    }
                    local.insert(BEST_SOLUTION, batch.index_axis(Axis(0), idx).to_owned().into_dyn());
                }
                self.emit(
                    ctx,
                    EventLevel::Info,
                    MonitorEventKind::NewBest {
                        fitness: values[idx],
                        previous: previous.is_finite().then_some(previous),
                    },
                );
                true
            }
            _ => false,
        };

        let stagnation = if improved {
            0.0
        } else {
            scalar_value(local.tensor(STAGNATION)?)? + 1.0
        };
        local.insert(STAGNATION, scalar(stagnation));
        if let Some(window) = self.config.stagnation_window {
            if !improved && stagnation as u64 == window {
                self.emit(
                    ctx,
                    EventLevel::Warning,
                    MonitorEventKind::Stagnation { generations: window },
                );
            }
        }

        if self.config.history_len > 0 {
            let best = scalar_value(local.tensor(BEST_FITNESS)?)?;
            let mut history = local.tensor(HISTORY)?.clone();
            let len = history.len();
            if let Some(slice) = history.as_slice_mut() {
                slice.rotate_left(1);
                slice[len - 1] = best;
            }
            local.insert(HISTORY, history);
        }
        Ok(())
    }
}

impl Default for EvalMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for EvalMonitor {
    fn schema(&self) -> Schema {
        let mut schema = Schema::new().mutable(BEST_FITNESS).mutable(EVALUATIONS).mutable(STAGNATION);
        if self.config.solution_dim.is_some() {
            schema = schema.mutable(BEST_SOLUTION);
        }
        if self.config.candidate_shape.is_some() {
            schema = schema.population(LATEST_CANDIDATES);
        }
        if self.config.history_len > 0 {
            schema = schema.mutable(HISTORY);
        }
        schema
    }

    fn init_state(&self, _ctx: &NodeContext, _rng: &mut Rng) -> EfResult<LocalState> {
        let mut local = LocalState::new()
            .with(BEST_FITNESS, scalar(f64::INFINITY))
            .with(EVALUATIONS, scalar(0.0))
            .with(STAGNATION, scalar(0.0));
        if let Some(dim) = self.config.solution_dim {
            local.insert(BEST_SOLUTION, full(&[dim], f64::NAN));
        }
        if let Some((pop, dim)) = self.config.candidate_shape {
            local.insert(LATEST_CANDIDATES, full(&[pop, dim], f64::NAN));
        }
        if self.config.history_len > 0 {
            local.insert(HISTORY, full(&[self.config.history_len], f64::NAN));
        }
        Ok(local)
    }
}

impl Monitor for EvalMonitor {
    fn hooks(&self) -> HookSet {
        let hooks = HookSet::empty().with(Hook::PostEval);
        if self.config.candidate_shape.is_some() {
            hooks.with(Hook::PostAsk)
        } else {
            hooks
        }
    }

    fn post_ask(
        &self,
        _ctx: &HookContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
    ) -> EfResult<Option<LocalState>> {
        let Some((pop, dim)) = self.config.candidate_shape else {
            return Ok(None);
        };
        let batch = candidates.as_dense()?;
        if batch.shape() != [pop, dim] {
            return Err(StructureError::ShapeMismatch {
                context: LATEST_CANDIDATES.into(),
                expected: vec![pop, dim],
                actual: batch.shape().to_vec(),
            }
            .into());
        }
        Ok(Some(local.clone().with(LATEST_CANDIDATES, batch.clone())))
    }

    fn post_eval(
        &self,
        ctx: &HookContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
        fitness: &Tensor,
    ) -> EfResult<Option<LocalState>> {
        let mut local = local.clone();
        let total = fitness.shape().first().copied().unwrap_or(0);
        let evaluations = Self::evaluations(&local)? + total as u64;
        local.insert(EVALUATIONS, scalar(evaluations as f64));

        let non_finite = fitness
            .axis_iter(Axis(0))
            .filter(|row| row.iter().any(|v| !v.is_finite()))
            .count();
        if non_finite > 0 {
            self.emit(
                ctx,
                EventLevel::Warning,
                MonitorEventKind::NonFiniteFitness {
                    count: non_finite,
                    total,
                },
            );
        }

        if fitness.ndim() == 1 {
            self.record_single_objective(ctx, &mut local, candidates, fitness)?;
        }
        Ok(Some(local))
    }

    fn provides_metric(&self) -> bool {
        true
    }

    fn metric(&self, local: &LocalState) -> EfResult<Option<Tensor>> {
        Ok(Some(local.tensor(BEST_FITNESS)?.clone()))
    }
}
