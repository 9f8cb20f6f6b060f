//! A whole workflow as a batched black-box problem.
//!
//! Each evaluation takes one hyper-parameter setting per instance, writes the
//! settings into the parameter leaves of a stacked copy of the inner state,
//! runs the inner workflow for a fixed number of steps with all instances in
//! lockstep and returns the inner monitor's metric per instance.

use std::collections::BTreeMap;

use tracing::{debug, info};

use ef_engine::StdWorkflow;
use ef_types::{
    repeat_leading, validation_error, Candidates, EfResult, HpoError, InputSpec, LocalState, Module, NodeContext,
    Problem, Rng, Schema, State, StepContext, Tensor, WorkflowError,
};

use crate::codec::ParamCodec;
use crate::config::HpoConfig;

/// Attribute holding the inner workflow's stacked state.
pub const INSTANCES: &str = "instances";

/// Hyper-parameter values keyed by qualified path, each with a leading
/// instance axis.
pub type ParamBatch = BTreeMap<String, Tensor>;

pub struct HpoProblem {
    workflow: StdWorkflow,
    config: HpoConfig,
    metric_monitor: String,
    shapes: BTreeMap<String, Vec<usize>>,
    defaults: ParamBatch,
    pristine: State,
    instances: State,
}

impl HpoProblem {
    /// Wrap an initialized workflow. `init_state` is the unbatched state
    /// produced by its `init`; it is stacked `num_instances` times.
    pub fn new(workflow: StdWorkflow, init_state: &State, config: HpoConfig) -> EfResult<Self> {
        config.validate()?;
        if !workflow.is_ready() {
            return Err(HpoError::WorkflowNotReady.into());
        }
        if init_state.is_batched() {
            return Err(HpoError::InvalidConfig {
                message: "initial state must not carry a batch dimension".into(),
            }
            .into());
        }

        let metric_monitor = match &config.metric_monitor {
            Some(name) => {
                if !workflow.monitor_names().any(|m| m == name.as_str()) {
                    return Err(WorkflowError::MissingMonitor { name: name.clone() }.into());
                }
                name.clone()
            }
            None => workflow
                .metric_monitor()
                .map(str::to_string)
                .ok_or_else(|| HpoError::InvalidConfig {
                    message: format!("workflow {} has no monitor exposing a metric", workflow.name()),
                })?,
        };

        let n = config.num_instances;
        let mut shapes = BTreeMap::new();
        let mut defaults = BTreeMap::new();
        for (path, spec) in workflow.parameters() {
            let default = spec
                .default
                .as_ref()
                .ok_or_else(|| validation_error!("parameter {path} has no default value"))?;
            shapes.insert(path.clone(), default.shape().to_vec());
            defaults.insert(path, repeat_leading(default, n));
        }

        let copies = vec![init_state.clone(); n];
        let pristine = workflow.shard(&State::stack(&copies)?)?;

        info!(
            workflow = %workflow.name(),
            instances = n,
            iterations = config.iterations,
            parameters = shapes.len(),
            metric = %metric_monitor,
            "Wrapped workflow for hyper-parameter optimization"
        );

        Ok(Self {
            workflow,
            config,
            metric_monitor,
            shapes,
            defaults,
            instances: pristine.clone(),
            pristine,
        })
    }

    pub fn workflow(&self) -> &StdWorkflow {
        &self.workflow
    }

    pub fn config(&self) -> &HpoConfig {
        &self.config
    }

    pub fn num_instances(&self) -> usize {
        self.config.num_instances
    }

    /// Per-instance shape of every tunable parameter.
    pub fn parameter_shapes(&self) -> &BTreeMap<String, Vec<usize>> {
        &self.shapes
    }

    /// The stacked state every evaluation starts from when
    /// `copy_init_state` is set.
    pub fn init_state(&self) -> &State {
        &self.pristine
    }

    /// State left by the latest [`HpoProblem::evaluate_batch`].
    pub fn instances(&self) -> &State {
        &self.instances
    }

    /// Default value of every parameter, repeated along a leading axis of
    /// `num_instances`.
    pub fn get_init_params(&self) -> ParamBatch {
        self.defaults.clone()
    }

    /// Codec between dense `(num_instances, D)` batches and parameter batches.
    pub fn codec(&self) -> ParamCodec {
        ParamCodec::new(self.shapes.clone())
    }

    pub fn reset(&mut self) {
        self.instances = self.pristine.clone();
    }

    /// Run one evaluation and return the metric per instance.
    ///
    /// Unless `copy_init_state` is set, the next call continues from the
    /// state this one ends in.
    pub fn evaluate_batch(&mut self, params: &ParamBatch) -> EfResult<Tensor> {
        let start = if self.config.copy_init_state {
            &self.pristine
        } else {
            &self.instances
        };
        let (metric, end) = self.run_from(start, params)?;
        if !self.config.copy_init_state {
            self.instances = end;
        }
        Ok(metric)
    }

    /// Reject the whole batch before any stepping if a single entry is off.
    pub fn check_params(&self, params: &ParamBatch) -> EfResult<()> {
        let n = self.config.num_instances;
        for (path, value) in params {
            let shape = self
                .shapes
                .get(path)
                .ok_or_else(|| HpoError::UnknownParameter { path: path.clone() })?;
            let leading = value.shape().first().copied();
            if leading != Some(n) {
                return Err(HpoError::InstanceCountMismatch {
                    path: path.clone(),
                    expected: n,
                    actual: leading.unwrap_or(0),
                }
                .into());
            }
            if value.shape()[1..] != shape[..] {
                return Err(HpoError::ParameterShape {
                    path: path.clone(),
                    expected: shape.clone(),
                    actual: value.shape()[1..].to_vec(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn run_from(&self, start: &State, params: &ParamBatch) -> EfResult<(Tensor, State)> {
        self.check_params(params)?;
        let mut state = start.clone();
        for (path, value) in params {
            state = state.with_leaf(path, value.clone())?;
        }
        debug!(
            workflow = %self.workflow.name(),
            instances = self.config.num_instances,
            overrides = params.len(),
            "Running hyper-parameter instances"
        );
        let state = self.workflow.run(&state, self.config.iterations)?;
        let metric = self.workflow.monitor_metric(&state, &self.metric_monitor)?;
        Ok((metric, state))
    }
}

impl Module for HpoProblem {
    fn schema(&self) -> Schema {
        Schema::new().mutable(INSTANCES)
    }

    fn init_state(&self, _ctx: &NodeContext, _rng: &mut Rng) -> EfResult<LocalState> {
        Ok(LocalState::new().with(INSTANCES, self.pristine.clone()))
    }
}

impl Problem for HpoProblem {
    fn input_spec(&self) -> InputSpec {
        InputSpec::Named(self.shapes.clone())
    }

    fn evaluate(
        &self,
        _ctx: &mut StepContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
    ) -> EfResult<(Tensor, LocalState)> {
        let params = candidates.as_named()?;
        let start = if self.config.copy_init_state {
            &self.pristine
        } else {
            local.nested(INSTANCES)?
        };
        let (metric, end) = self.run_from(start, params)?;
        let local = if self.config.copy_init_state {
            local.clone()
        } else {
            local.clone().with(INSTANCES, end)
        };
        Ok((metric, local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use ef_components::{Pso, Sphere};
    use ef_engine::GENERATION;
    use ef_monitor::{EvalMonitor, HpoFitnessMonitor};
    use ef_types::{scalar, scalar_value, vector, EfError};

    fn inner(pop_size: usize) -> (StdWorkflow, State) {
        let mut workflow = StdWorkflow::builder(Pso::new(vec![-5.0, -5.0], vec![5.0, 5.0], pop_size).unwrap(), Sphere::new())
            .named_monitor("fitness", HpoFitnessMonitor::new())
            .seed(7)
            .build()
            .unwrap();
        let state = workflow.init().unwrap();
        (workflow, state)
    }

    fn hpo(iterations: usize, instances: usize, copy: bool) -> HpoProblem {
        let (workflow, state) = inner(10);
        let config = HpoConfig::new(iterations, instances).with_copy_init_state(copy);
        HpoProblem::new(workflow, &state, config).unwrap()
    }

    /// Sphere that counts how often it is evaluated.
    struct CountingSphere {
        calls: Arc<AtomicUsize>,
    }

    impl Module for CountingSphere {}

    impl Problem for CountingSphere {
        fn evaluate(
            &self,
            ctx: &mut StepContext<'_>,
            local: &LocalState,
            candidates: &Candidates,
        ) -> EfResult<(Tensor, LocalState)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Sphere::new().evaluate(ctx, local, candidates)
        }
    }

    #[test]
    fn init_params_are_broadcast_defaults() {
        let problem = hpo(3, 5, true);
        let first = problem.get_init_params();
        let second = problem.get_init_params();
        assert_eq!(first, second);
        assert_eq!(
            first.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["algorithm.phi_g", "algorithm.phi_p", "algorithm.w"]
        );
        assert_eq!(first["algorithm.w"], vector(vec![0.6; 5]));
        assert_eq!(problem.init_state().batch_dims(), &[5]);
    }

    #[test]
    fn repeated_evaluation_is_identical() {
        let mut problem = hpo(15, 5, true);
        let params = problem.get_init_params();
        let first = problem.evaluate_batch(&params).unwrap();
        let second = problem.evaluate_batch(&params).unwrap();
        assert_eq!(first.shape(), &[5]);
        assert!(first.iter().all(|v| v.is_finite()));
        assert_eq!(first, second);
    }

    #[test]
    fn instance_count_mismatch_fails_before_stepping() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut workflow = StdWorkflow::builder(
            Pso::new(vec![-1.0], vec![1.0], 4).unwrap(),
            CountingSphere { calls: calls.clone() },
        )
        .monitor(EvalMonitor::new())
        .build()
        .unwrap();
        let state = workflow.init().unwrap();
        let mut problem = HpoProblem::new(workflow, &state, HpoConfig::new(5, 5)).unwrap();

        let mut params = problem.get_init_params();
        params.insert("algorithm.w".into(), vector(vec![0.5; 3]));
        let err = problem.evaluate_batch(&params).unwrap_err();
        assert!(matches!(
            err,
            EfError::Hpo(HpoError::InstanceCountMismatch {
                expected: 5,
                actual: 3,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        problem.evaluate_batch(&problem.get_init_params()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5 * 5);
    }

    #[test]
    fn unknown_and_misshaped_parameters_rejected() {
        let mut problem = hpo(2, 3, true);
        let unknown = BTreeMap::from([("algorithm.velocity".to_string(), vector(vec![0.0; 3]))]);
        assert!(matches!(
            problem.evaluate_batch(&unknown),
            Err(EfError::Hpo(HpoError::UnknownParameter { .. }))
        ));
        let misshaped = BTreeMap::from([(
            "algorithm.w".to_string(),
            ef_types::matrix(3, 2, vec![0.5; 6]).unwrap(),
        )]);
        assert!(matches!(
            problem.evaluate_batch(&misshaped),
            Err(EfError::Hpo(HpoError::ParameterShape { .. }))
        ));
        let scalar_value_only = BTreeMap::from([("algorithm.w".to_string(), scalar(0.5))]);
        assert!(problem.evaluate_batch(&scalar_value_only).is_err());
    }

    #[test]
    fn instances_are_independent() {
        let mut problem = hpo(10, 3, true);
        let base = problem.get_init_params();
        let reference = problem.evaluate_batch(&base).unwrap();

        let mut perturbed = base.clone();
        perturbed.insert("algorithm.w".into(), vector(vec![0.1, 0.6, 0.6]));
        perturbed.insert("algorithm.phi_g".into(), vector(vec![2.0, 0.8, 0.8]));
        let changed = problem.evaluate_batch(&perturbed).unwrap();
        let changed = changed.as_slice().unwrap();
        let reference = reference.as_slice().unwrap();
        assert_eq!(&changed[1..], &reference[1..]);
    }

    #[test]
    fn without_copy_the_state_carries_over() {
        let mut problem = hpo(4, 2, false);
        let params = problem.get_init_params();
        let first = problem.evaluate_batch(&params).unwrap();
        let second = problem.evaluate_batch(&params).unwrap();
        assert!(second.iter().zip(first.iter()).all(|(b, a)| b <= a));

        let generation = problem.instances().leaf(GENERATION).unwrap();
        assert!(generation.iter().all(|g| *g == 8.0));
        problem.reset();
        assert_eq!(problem.instances(), problem.init_state());
    }

    #[test]
    fn wrapping_requires_ready_workflow() {
        let workflow = StdWorkflow::builder(Pso::new(vec![-1.0], vec![1.0], 4).unwrap(), Sphere::new())
            .monitor(EvalMonitor::new())
            .build()
            .unwrap();
        let result = HpoProblem::new(workflow, &State::new(), HpoConfig::new(1, 2));
        assert!(matches!(result, Err(EfError::Hpo(HpoError::WorkflowNotReady))));
    }

    #[test]
    fn workflow_without_metric_rejected() {
        let mut workflow = StdWorkflow::builder(Pso::new(vec![-1.0], vec![1.0], 4).unwrap(), Sphere::new())
            .build()
            .unwrap();
        let state = workflow.init().unwrap();
        assert!(HpoProblem::new(workflow, &state, HpoConfig::new(1, 2)).is_err());
    }

    #[test]
    fn nested_in_an_outer_workflow() {
        let problem = hpo(5, 4, true);
        let codec = problem.codec();
        assert_eq!(codec.dim(), 3);

        // Columns follow path order: phi_g, phi_p, w.
        let outer_algorithm = Pso::new(vec![0.0, 0.0, 0.0], vec![2.0, 3.0, 1.0], 4).unwrap();
        let mut outer = StdWorkflow::builder(outer_algorithm, problem)
            .solution_transform(codec)
            .monitor(EvalMonitor::new())
            .seed(1)
            .build()
            .unwrap();
        let state = outer.init().unwrap();
        assert_eq!(state.resolve("problem").unwrap().nested(INSTANCES).unwrap().batch_dims(), &[4]);

        let state = outer.run(&state, 2).unwrap();
        let best = outer.monitor_metric(&state, "monitor").unwrap();
        assert!(scalar_value(&best).unwrap().is_finite());
        assert_eq!(scalar_value(state.leaf(GENERATION).unwrap()).unwrap(), 2.0);
    }
}
