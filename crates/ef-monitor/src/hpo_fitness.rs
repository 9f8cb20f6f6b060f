//! Best-so-far fitness monitor used as the metric of an inner HPO workflow.

use std::sync::Arc;

use ef_types::{
    as_matrix, as_vector, scalar, scalar_value, EfResult, Hook, HookContext, HookSet, LocalState, Module, Monitor,
    NodeContext, Rng, Schema, Tensor, WorkflowError,
};

use crate::indicators::{mask_non_finite_rows, Igd, Indicator};

pub const BEST: &str = "best";

/// Tracks the lowest fitness seen so far, reading it just before `tell`.
///
/// Multi-objective fitness is reduced with an [`Indicator`] after dropping
/// rows that contain NaN or infinite objectives.
#[derive(Clone, Default)]
pub struct HpoFitnessMonitor {
    indicator: Option<Arc<dyn Indicator>>,
}

impl HpoFitnessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_indicator(mut self, indicator: impl Indicator + 'static) -> Self {
        self.indicator = Some(Arc::new(indicator));
        self
    }

    /// Use IGD against `front` for multi-objective fitness.
    pub fn with_igd(self, front: &Tensor) -> EfResult<Self> {
        Ok(self.with_indicator(Igd::new(front)?))
    }

    pub fn best(local: &LocalState) -> EfResult<f64> {
        scalar_value(local.tensor(BEST)?)
    }

    fn reduce(&self, ctx: &HookContext<'_>, fitness: &Tensor) -> EfResult<f64> {
        match fitness.ndim() {
            1 => Ok(as_vector(fitness, "fitness")?
                .iter()
                .copied()
                .filter(|v| !v.is_nan())
                .fold(f64::INFINITY, f64::min)),
            _ => {
                let indicator = self.indicator.as_ref().ok_or_else(|| WorkflowError::Component {
                    path: ctx.node.display_path().to_string(),
                    message: "multi-objective fitness needs an indicator".into(),
                })?;
                let objectives = mask_non_finite_rows(as_matrix(fitness, "fitness")?);
                indicator.compute(objectives.view())
            }
        }
    }
}

impl Module for HpoFitnessMonitor {
    fn schema(&self) -> Schema {
        Schema::new().mutable(BEST)
    }

    fn init_state(&self, _ctx: &NodeContext, _rng: &mut Rng) -> EfResult<LocalState> {
        Ok(LocalState::new().with(BEST, scalar(f64::INFINITY)))
    }
}

impl Monitor for HpoFitnessMonitor {
    fn hooks(&self) -> HookSet {
        HookSet::empty().with(Hook::PreTell)
    }

    fn pre_tell(&self, ctx: &HookContext<'_>, local: &LocalState, fitness: &Tensor) -> EfResult<Option<LocalState>> {
        let value = self.reduce(ctx, fitness)?;
        let best = Self::best(local)?;
        if value < best {
            return Ok(Some(local.clone().with(BEST, scalar(value))));
        }
        Ok(None)
    }

    fn provides_metric(&self) -> bool {
        true
    }

    fn metric(&self, local: &LocalState) -> EfResult<Option<Tensor>> {
        Ok(Some(local.tensor(BEST)?.clone()))
    }
}
