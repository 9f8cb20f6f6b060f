// Standard ask/evaluate/tell workflow
// Threads a State through the algorithm, problem and monitors of one tree

use ef_types::{
    scalar, scalar_value, stack_leading, Algorithm, AttributeSpec, Candidates, DeviceMesh, EfResult,
    Hook, HookSet, LocalState, Module, ModuleTree, Monitor, NodeContext, PlacementSpec, Problem, Rng,
    RngKey, Schema, SolutionTransform, State, StepContext, Tensor, WorkflowError,
};
use tracing::{debug, info};

use crate::config::WorkflowConfig;
use crate::control_flow::{select_state, while_loop};
use crate::hooks::{self, HookArgs, MonitorSlot};
use crate::lanes::{self, run_stage};

/// Root attribute holding the number of completed steps.
pub const GENERATION: &str = "generation";
/// Root attribute holding the workflow's random key.
pub const KEY: &str = "key";

const ASK_STREAM: u64 = 1;
const EVAL_STREAM: u64 = 2;
const TELL_STREAM: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Ready,
}

/// The children of a workflow node.
struct Components {
    algorithm: Box<dyn Algorithm>,
    problem: Box<dyn Problem>,
    monitors: Vec<MonitorSlot>,
    seed: u64,
}

impl Module for Components {
    fn schema(&self) -> Schema {
        Schema::new().mutable(GENERATION).mutable(KEY)
    }

    fn submodules(&self) -> Vec<(&str, &dyn Module)> {
        let mut children = vec![
            ("algorithm", self.algorithm.as_module()),
            ("problem", self.problem.as_module()),
        ];
        children.extend(
            self.monitors
                .iter()
                .map(|slot| (slot.name.as_str(), slot.monitor.as_module())),
        );
        children
    }

    fn init_state(&self, _ctx: &NodeContext, _rng: &mut Rng) -> EfResult<LocalState> {
        Ok(LocalState::new()
            .with(GENERATION, scalar(0.0))
            .with(KEY, RngKey::new(self.seed).to_tensor()))
    }
}

/// Per-lane scratch space carried between the stages of one step.
struct Lane {
    state: State,
    key: RngKey,
    generation: u64,
    candidates: Option<Candidates>,
    fitness: Option<Tensor>,
}

impl Lane {
    fn new(state: State) -> EfResult<Self> {
        let root = state.resolve("")?;
        let key = RngKey::from_tensor(root.tensor(KEY)?)?;
        let generation = scalar_value(root.tensor(GENERATION)?)? as u64;
        Ok(Self {
            state,
            key,
            generation,
            candidates: None,
            fitness: None,
        })
    }

    fn candidates(&self) -> EfResult<&Candidates> {
        self.candidates
            .as_ref()
            .ok_or_else(|| ef_types::internal_error!("candidates read before ask"))
    }

    fn fitness(&self) -> EfResult<&Tensor> {
        self.fitness
            .as_ref()
            .ok_or_else(|| ef_types::internal_error!("fitness read before evaluate"))
    }
}

/// Workflow that composes one algorithm, one problem and any number of
/// monitors, plus an optional solution transform between ask and evaluate.
pub struct StdWorkflow {
    config: WorkflowConfig,
    components: Components,
    transform: Option<Box<dyn SolutionTransform>>,
    tree: ModuleTree,
    algorithm_ctx: NodeContext,
    problem_ctx: NodeContext,
    placement: Option<PlacementSpec>,
    phase: Phase,
}

impl StdWorkflow {
    pub fn builder(
        algorithm: impl Algorithm + 'static,
        problem: impl Problem + 'static,
    ) -> WorkflowBuilder {
        WorkflowBuilder::new(algorithm, problem)
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn tree(&self) -> &ModuleTree {
        &self.tree
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    pub fn algorithm(&self) -> &dyn Algorithm {
        self.components.algorithm.as_ref()
    }

    pub fn problem(&self) -> &dyn Problem {
        self.components.problem.as_ref()
    }

    /// Every tunable parameter in the tree, keyed by qualified path.
    pub fn parameters(&self) -> Vec<(String, &AttributeSpec)> {
        self.tree.parameters()
    }

    pub fn monitor_names(&self) -> impl Iterator<Item = &str> {
        self.components.monitors.iter().map(|m| m.name.as_str())
    }

    /// First monitor that exposes a metric.
    pub fn metric_monitor(&self) -> Option<&str> {
        self.components
            .monitors
            .iter()
            .find(|m| m.monitor.provides_metric())
            .map(|m| m.name.as_str())
    }

    /// Produce the first state and mark the workflow ready.
    pub fn init(&mut self) -> EfResult<State> {
        info!(
            workflow = %self.config.name,
            seed = self.config.seed,
            nodes = self.tree.len(),
            "Initializing workflow"
        );
        let state = self
            .tree
            .init_state(&self.components, RngKey::new(self.config.seed))?;
        let state = hooks::dispatch(&self.components.monitors, Hook::Setup, state, 0, 0, HookArgs::Empty)?;
        let state = self.place(state)?;
        self.phase = Phase::Ready;
        Ok(state)
    }

    /// Spread population-sized leaves across `mesh`; everything else stays
    /// replicated. Applies to every state produced afterwards.
    pub fn enable_multi_devices(&mut self, mesh: DeviceMesh) -> EfResult<()> {
        if mesh.is_empty() {
            return Err(ef_types::config_error!("cannot place {} on an empty device mesh", self.config.name));
        }
        let spec = self
            .tree
            .population_leaves()
            .into_iter()
            .fold(PlacementSpec::replicated(mesh.clone()), |spec, (leaf, axis)| {
                spec.split_leaf(leaf, axis)
            });
        info!(
            workflow = %self.config.name,
            devices = mesh.len(),
            split_leaves = spec.split_axes.len(),
            "Enabling multi-device placement"
        );
        self.config.devices = Some(mesh);
        self.placement = Some(spec);
        Ok(())
    }

    /// Attach this workflow's placement to `state`.
    pub fn shard(&self, state: &State) -> EfResult<State> {
        self.place(state.clone())
    }

    fn place(&self, state: State) -> EfResult<State> {
        match &self.placement {
            Some(spec) => state.shard(spec),
            None => Ok(state),
        }
    }

    /// Advance every lane of `state` by one generation.
    pub fn step(&self, state: &State) -> EfResult<State> {
        self.ensure_ready(state)?;
        let (lane_states, dims) = lanes::flatten(state)?;
        let mut lanes = lane_states
            .into_iter()
            .map(Lane::new)
            .collect::<EfResult<Vec<_>>>()?;
        let parallel = self.config.parallel_lanes;
        debug!(workflow = %self.config.name, lanes = lanes.len(), "Starting step");

        // 1. pre_ask hooks
        run_stage(&mut lanes, parallel, |i, lane| self.run_hooks(Hook::PreAsk, i, lane))?;
        // 2. ask
        run_stage(&mut lanes, parallel, |i, lane| self.ask(i, lane))?;
        // 3. post_ask hooks
        run_stage(&mut lanes, parallel, |i, lane| self.run_hooks(Hook::PostAsk, i, lane))?;
        // 4. solution transform and input contract
        run_stage(&mut lanes, parallel, |_, lane| self.transform(lane))?;
        // 5. evaluate, bracketed by pre_eval / post_eval
        run_stage(&mut lanes, parallel, |i, lane| self.run_hooks(Hook::PreEval, i, lane))?;
        run_stage(&mut lanes, parallel, |i, lane| self.evaluate(i, lane))?;
        run_stage(&mut lanes, parallel, |i, lane| self.run_hooks(Hook::PostEval, i, lane))?;
        // 6-7. tell, bracketed by pre_tell / post_tell
        run_stage(&mut lanes, parallel, |i, lane| self.run_hooks(Hook::PreTell, i, lane))?;
        run_stage(&mut lanes, parallel, |i, lane| self.tell(i, lane))?;
        run_stage(&mut lanes, parallel, |i, lane| self.run_hooks(Hook::PostTell, i, lane))?;

        run_stage(&mut lanes, parallel, |_, lane| advance(lane))?;

        let generation = lanes.first().map(|l| l.generation + 1).unwrap_or_default();
        let next = lanes::unflatten(lanes.into_iter().map(|l| l.state).collect(), &dims)?;
        debug!(workflow = %self.config.name, generation, "Step complete");
        self.place(next)
    }

    /// Apply `steps` consecutive steps.
    pub fn run(&self, state: &State, steps: usize) -> EfResult<State> {
        let (_, out) = while_loop(
            (0usize, state.clone()),
            |(i, _)| Ok(*i < steps),
            |(i, s)| Ok((i + 1, self.step(&s)?)),
        )?;
        Ok(out)
    }

    /// Step while `pred` holds, at most `max_steps` times. On a batched state
    /// the predicate is evaluated per lane and lanes that stop are frozen
    /// while the rest continue.
    pub fn run_while<P>(&self, state: &State, max_steps: usize, mut pred: P) -> EfResult<State>
    where
        P: FnMut(&State) -> EfResult<bool>,
    {
        if !state.is_batched() {
            let (_, out) = while_loop(
                (0usize, state.clone()),
                |(i, s)| Ok(*i < max_steps && pred(s)?),
                |(i, s)| Ok((i + 1, self.step(&s)?)),
            )?;
            return Ok(out);
        }

        let mut current = self.place(state.clone())?;
        for _ in 0..max_steps {
            let (lane_states, _) = lanes::flatten(&current)?;
            let mask = lane_states.iter().map(&mut pred).collect::<EfResult<Vec<bool>>>()?;
            if !mask.iter().any(|m| *m) {
                break;
            }
            let advanced = self.step(&current)?;
            current = self.place(select_state(&mask, &advanced, &current)?)?;
        }
        Ok(current)
    }

    /// Read a monitor's metric. A batched state yields one value per lane,
    /// shaped `(batch dims..., metric shape...)`.
    pub fn monitor_metric(&self, state: &State, name: &str) -> EfResult<Tensor> {
        let slot = self
            .components
            .monitors
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| WorkflowError::MissingMonitor { name: name.to_string() })?;
        let (lane_states, dims) = lanes::flatten(state)?;
        let values = lane_states
            .iter()
            .map(|lane| {
                let local = lane.resolve(&slot.ctx.path)?;
                slot.monitor.metric(local)?.ok_or_else(|| {
                    WorkflowError::NoMetric {
                        path: slot.ctx.display_path().to_string(),
                    }
                    .into()
                })
            })
            .collect::<EfResult<Vec<Tensor>>>()?;
        if dims.is_empty() {
            return values
                .into_iter()
                .next()
                .ok_or_else(|| ef_types::internal_error!("unbatched state produced no lanes"));
        }
        let stacked = stack_leading(&values)?;
        let mut shape = dims;
        shape.extend_from_slice(&stacked.shape()[1..]);
        Ok(stacked.into_shape(shape)?)
    }

    fn ensure_ready(&self, state: &State) -> EfResult<()> {
        if self.phase != Phase::Ready {
            return Err(WorkflowError::NotInitialized {
                path: self.tree.root().ctx.display_path().to_string(),
            }
            .into());
        }
        for node in self.tree.iter() {
            if !state.contains(&node.ctx.path) {
                return Err(WorkflowError::NotInitialized {
                    path: node.ctx.display_path().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn run_hooks(&self, hook: Hook, index: usize, lane: &mut Lane) -> EfResult<()> {
        let args = match hook {
            Hook::PostAsk | Hook::PreEval => HookArgs::Candidates(lane.candidates()?),
            Hook::PostEval => HookArgs::Evaluated(lane.candidates()?, lane.fitness()?),
            Hook::PreTell => HookArgs::Fitness(lane.fitness()?),
            Hook::Setup | Hook::PreAsk | Hook::PostTell => HookArgs::Empty,
        };
        let state = hooks::dispatch(
            &self.components.monitors,
            hook,
            lane.state.clone(),
            lane.generation,
            index,
            args,
        )?;
        lane.state = state;
        Ok(())
    }

    fn ask(&self, index: usize, lane: &mut Lane) -> EfResult<()> {
        let ctx = &self.algorithm_ctx;
        let mut step_ctx = StepContext::new(ctx, lane.key, lane.generation, index, ASK_STREAM);
        let local = lane.state.resolve(&ctx.path)?;
        let (candidates, local) = self.components.algorithm.ask(&mut step_ctx, local)?;
        let n = candidates.len()?;
        if let Some(expected) = self.components.algorithm.pop_size() {
            if n != expected {
                return Err(WorkflowError::Component {
                    path: ctx.display_path().to_string(),
                    message: format!("asked {n} candidates, population size is {expected}"),
                }
                .into());
            }
        }
        lane.state = lane.state.update(&ctx.path, local)?;
        lane.candidates = Some(candidates);
        Ok(())
    }

    fn transform(&self, lane: &mut Lane) -> EfResult<()> {
        if let Some(transform) = &self.transform {
            let raw = lane
                .candidates
                .take()
                .ok_or_else(|| ef_types::internal_error!("candidates read before ask"))?;
            let n = raw.len()?;
            let transformed = transform.transform(raw)?;
            let m = transformed.len()?;
            if m != n {
                return Err(WorkflowError::InputMismatch {
                    message: format!("solution transform changed batch size from {n} to {m}"),
                }
                .into());
            }
            lane.candidates = Some(transformed);
        }
        self.components.problem.input_spec().check(lane.candidates()?)
    }

    fn evaluate(&self, index: usize, lane: &mut Lane) -> EfResult<()> {
        let ctx = &self.problem_ctx;
        let mut step_ctx = StepContext::new(ctx, lane.key, lane.generation, index, EVAL_STREAM);
        let candidates = lane.candidates()?;
        let n = candidates.len()?;
        let local = lane.state.resolve(&ctx.path)?;
        let (fitness, local) = self.components.problem.evaluate(&mut step_ctx, local, candidates)?;
        if !(1..=2).contains(&fitness.ndim()) || fitness.shape()[0] != n {
            return Err(WorkflowError::FitnessShape {
                expected_batch: n,
                actual: fitness.shape().to_vec(),
            }
            .into());
        }
        lane.state = lane.state.update(&ctx.path, local)?;
        lane.fitness = Some(fitness);
        Ok(())
    }

    fn tell(&self, index: usize, lane: &mut Lane) -> EfResult<()> {
        let ctx = &self.algorithm_ctx;
        let mut step_ctx = StepContext::new(ctx, lane.key, lane.generation, index, TELL_STREAM);
        let local = lane.state.resolve(&ctx.path)?;
        let local = self
            .components
            .algorithm
            .tell(&mut step_ctx, local, lane.fitness()?)?;
        lane.state = lane.state.update(&ctx.path, local)?;
        Ok(())
    }
}

fn advance(lane: &mut Lane) -> EfResult<()> {
    let root = lane.state.resolve("")?.clone();
    lane.state = lane
        .state
        .update("", root.with(GENERATION, scalar((lane.generation + 1) as f64)))?;
    Ok(())
}

impl Module for StdWorkflow {
    fn schema(&self) -> Schema {
        self.components.schema()
    }

    fn submodules(&self) -> Vec<(&str, &dyn Module)> {
        self.components.submodules()
    }

    fn init_state(&self, ctx: &NodeContext, rng: &mut Rng) -> EfResult<LocalState> {
        self.components.init_state(ctx, rng)
    }
}

/// Assembles a [`StdWorkflow`] and builds its module tree.
pub struct WorkflowBuilder {
    algorithm: Box<dyn Algorithm>,
    problem: Box<dyn Problem>,
    monitors: Vec<(Option<String>, Box<dyn Monitor>)>,
    transform: Option<Box<dyn SolutionTransform>>,
    config: WorkflowConfig,
}

impl WorkflowBuilder {
    pub fn new(algorithm: impl Algorithm + 'static, problem: impl Problem + 'static) -> Self {
        Self {
            algorithm: Box::new(algorithm),
            problem: Box::new(problem),
            monitors: Vec::new(),
            transform: None,
            config: WorkflowConfig::default(),
        }
    }

    /// Add a monitor named `monitor`, `monitor_1`, `monitor_2`, ... in order.
    pub fn monitor(mut self, monitor: impl Monitor + 'static) -> Self {
        self.monitors.push((None, Box::new(monitor)));
        self
    }

    pub fn named_monitor(mut self, name: impl Into<String>, monitor: impl Monitor + 'static) -> Self {
        self.monitors.push((Some(name.into()), Box::new(monitor)));
        self
    }

    pub fn solution_transform(mut self, transform: impl SolutionTransform + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn build(self) -> EfResult<StdWorkflow> {
        self.config.validate()?;

        let mut auto = 0usize;
        let monitors = self
            .monitors
            .into_iter()
            .map(|(name, monitor)| {
                let name = name.unwrap_or_else(|| {
                    let name = if auto == 0 {
                        "monitor".to_string()
                    } else {
                        format!("monitor_{auto}")
                    };
                    auto += 1;
                    name
                });
                let hooks: HookSet = monitor.hooks();
                MonitorSlot {
                    name,
                    ctx: NodeContext::root(),
                    hooks,
                    monitor,
                }
            })
            .collect::<Vec<_>>();

        let mut components = Components {
            algorithm: self.algorithm,
            problem: self.problem,
            monitors,
            seed: self.config.seed,
        };
        let tree = ModuleTree::build(&components)?;
        for slot in &mut components.monitors {
            slot.ctx = tree.context(&slot.name)?.clone();
        }
        let algorithm_ctx = tree.context("algorithm")?.clone();
        let problem_ctx = tree.context("problem")?.clone();

        info!(
            workflow = %self.config.name,
            nodes = tree.len(),
            monitors = components.monitors.len(),
            transform = self.transform.is_some(),
            "Built workflow"
        );

        let devices = self.config.devices.clone();
        let mut workflow = StdWorkflow {
            config: self.config,
            components,
            transform: self.transform,
            tree,
            algorithm_ctx,
            problem_ctx,
            placement: None,
            phase: Phase::Uninitialized,
        };
        if let Some(mesh) = devices {
            workflow.enable_multi_devices(mesh)?;
        }
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_components::{Pso, Sphere};
    use ef_monitor::EvalMonitor;
    use ef_types::{vector, EfError, InputSpec, ShardDirective, StructureError};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    fn pso_workflow(pop_size: usize, seed: u64) -> StdWorkflow {
        StdWorkflow::builder(Pso::new(vec![-10.0], vec![10.0], pop_size).unwrap(), Sphere::new())
            .monitor(EvalMonitor::new())
            .seed(seed)
            .build()
            .unwrap()
    }

    fn generation(state: &State) -> f64 {
        scalar_value(state.leaf(GENERATION).unwrap()).unwrap()
    }

    /// Records the order in which hooks fire.
    struct Recorder {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Recorder {
        fn record(&self, name: &'static str) -> EfResult<Option<LocalState>> {
            self.log
                .lock()
                .map_err(|_| ef_types::internal_error!("poisoned"))?
                .push(name);
            Ok(None)
        }
    }

    impl Module for Recorder {}

    impl Monitor for Recorder {
        fn hooks(&self) -> HookSet {
            HookSet::all()
        }

        fn setup(&self, _: &ef_types::HookContext<'_>, _: &LocalState) -> EfResult<Option<LocalState>> {
            self.record("setup")
        }

        fn pre_ask(&self, _: &ef_types::HookContext<'_>, _: &LocalState) -> EfResult<Option<LocalState>> {
            self.record("pre_ask")
        }

        fn post_ask(
            &self,
            _: &ef_types::HookContext<'_>,
            _: &LocalState,
            _: &Candidates,
        ) -> EfResult<Option<LocalState>> {
            self.record("post_ask")
        }

        fn pre_eval(
            &self,
            _: &ef_types::HookContext<'_>,
            _: &LocalState,
            _: &Candidates,
        ) -> EfResult<Option<LocalState>> {
            self.record("pre_eval")
        }

        fn post_eval(
            &self,
            _: &ef_types::HookContext<'_>,
            _: &LocalState,
            _: &Candidates,
            _: &Tensor,
        ) -> EfResult<Option<LocalState>> {
            self.record("post_eval")
        }

        fn pre_tell(&self, _: &ef_types::HookContext<'_>, _: &LocalState, _: &Tensor) -> EfResult<Option<LocalState>> {
            self.record("pre_tell")
        }

        fn post_tell(&self, _: &ef_types::HookContext<'_>, _: &LocalState) -> EfResult<Option<LocalState>> {
            self.record("post_tell")
        }
    }

    /// Problem that only accepts named input and counts its evaluations.
    struct NamedSphere {
        calls: Arc<AtomicUsize>,
    }

    impl Module for NamedSphere {}

    impl Problem for NamedSphere {
        fn input_spec(&self) -> InputSpec {
            InputSpec::Named(BTreeMap::from([("x".to_string(), vec![1])]))
        }

        fn evaluate(
            &self,
            _ctx: &mut StepContext<'_>,
            local: &LocalState,
            candidates: &Candidates,
        ) -> EfResult<(Tensor, LocalState)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let x = &candidates.as_named()?["x"];
            let fitness = x.map_axis(ndarray::Axis(1), |row| row.iter().map(|v| v * v).sum::<f64>());
            Ok((fitness, local.clone()))
        }
    }

    fn to_named(candidates: Candidates) -> EfResult<Candidates> {
        let dense = candidates.as_dense()?.clone();
        Ok(Candidates::Named(BTreeMap::from([("x".to_string(), dense)])))
    }

    #[test]
    fn test_init_resolves_every_declared_path() {
        let mut workflow = pso_workflow(8, 0);
        let state = workflow.init().unwrap();
        let paths: Vec<_> = workflow.tree().iter().map(|n| n.ctx.path.clone()).collect();
        assert_eq!(paths, vec!["", "algorithm", "problem", "monitor"]);
        for node in workflow.tree().iter() {
            let local = state.resolve(&node.ctx.path).unwrap();
            let mut declared: Vec<_> = node.schema.stateful().map(|a| a.name.as_str()).collect();
            declared.sort();
            assert_eq!(local.names().collect::<Vec<_>>(), declared);
        }
        assert_eq!(generation(&state), 0.0);
        assert!(workflow.is_ready());
    }

    #[test]
    fn test_step_before_init_fails() {
        let mut workflow = pso_workflow(8, 0);
        let err = workflow.step(&State::new()).unwrap_err();
        assert!(matches!(
            err,
            EfError::Workflow(WorkflowError::NotInitialized { ref path }) if path == "<root>"
        ));

        let state = workflow.init().unwrap();
        let partial = State::new()
            .with_node("", state.resolve("").unwrap().clone())
            .with_node("algorithm", state.resolve("algorithm").unwrap().clone())
            .with_node("problem", state.resolve("problem").unwrap().clone());
        match workflow.step(&partial) {
            Err(EfError::Workflow(WorkflowError::NotInitialized { path })) => assert_eq!(path, "monitor"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_step_is_deterministic() {
        let mut workflow = pso_workflow(16, 3);
        let state = workflow.init().unwrap();
        let state = workflow.run(&state, 3).unwrap();
        let a = workflow.step(&state).unwrap();
        let b = workflow.step(&state).unwrap();
        assert_eq!(a, b);
        assert_eq!(generation(&a), 4.0);

        let mut again = pso_workflow(16, 3);
        let replay = again.init().unwrap();
        assert_eq!(again.run(&replay, 4).unwrap(), a);
    }

    #[test]
    fn test_step_leaves_input_untouched() {
        let mut workflow = pso_workflow(8, 1);
        let state = workflow.init().unwrap();
        let snapshot = state.clone();
        let next = workflow.step(&state).unwrap();
        assert_eq!(state, snapshot);
        assert_ne!(next, state);
    }

    #[test]
    fn test_pso_converges_on_sphere() {
        let mut workflow = pso_workflow(100, 42);
        let mut state = workflow.init().unwrap();
        let mut previous = f64::INFINITY;
        for _ in 0..100 {
            state = workflow.step(&state).unwrap();
            let best = scalar_value(&workflow.monitor_metric(&state, "monitor").unwrap()).unwrap();
            assert!(best <= previous, "best fitness worsened: {best} > {previous}");
            previous = best;
        }
        assert!(previous <= 1e-3, "best fitness {previous} above bound");
    }

    #[test]
    fn test_hook_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut workflow = StdWorkflow::builder(Pso::new(vec![-1.0], vec![1.0], 4).unwrap(), Sphere::new())
            .monitor(Recorder { log: log.clone() })
            .build()
            .unwrap();
        let state = workflow.init().unwrap();
        workflow.step(&state).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["setup", "pre_ask", "post_ask", "pre_eval", "post_eval", "pre_tell", "post_tell"]
        );
    }

    #[test]
    fn test_input_mismatch_fails_before_evaluate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut workflow = StdWorkflow::builder(
            Pso::new(vec![-1.0], vec![1.0], 4).unwrap(),
            NamedSphere { calls: calls.clone() },
        )
        .build()
        .unwrap();
        let state = workflow.init().unwrap();
        assert!(matches!(
            workflow.step(&state),
            Err(EfError::Workflow(WorkflowError::InputMismatch { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_solution_transform_feeds_problem() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut workflow = StdWorkflow::builder(
            Pso::new(vec![-1.0], vec![1.0], 4).unwrap(),
            NamedSphere { calls: calls.clone() },
        )
        .solution_transform(to_named)
        .monitor(EvalMonitor::new())
        .build()
        .unwrap();
        let state = workflow.init().unwrap();
        let state = workflow.run(&state, 2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let best = scalar_value(&workflow.monitor_metric(&state, "monitor").unwrap()).unwrap();
        assert!(best.is_finite());
    }

    #[test]
    fn test_duplicate_monitor_names_rejected() {
        let result = StdWorkflow::builder(Pso::new(vec![-1.0], vec![1.0], 4).unwrap(), Sphere::new())
            .named_monitor("eval", EvalMonitor::new())
            .named_monitor("eval", EvalMonitor::new())
            .build();
        assert!(matches!(
            result,
            Err(EfError::Structure(StructureError::DuplicateChild { .. }))
        ));

        let reserved = StdWorkflow::builder(Pso::new(vec![-1.0], vec![1.0], 4).unwrap(), Sphere::new())
            .named_monitor("problem", EvalMonitor::new())
            .build();
        assert!(reserved.is_err());
    }

    #[test]
    fn test_auto_monitor_names() {
        let workflow = StdWorkflow::builder(Pso::new(vec![-1.0], vec![1.0], 4).unwrap(), Sphere::new())
            .monitor(EvalMonitor::new())
            .monitor(EvalMonitor::new())
            .build()
            .unwrap();
        assert_eq!(workflow.monitor_names().collect::<Vec<_>>(), vec!["monitor", "monitor_1"]);
        assert_eq!(workflow.metric_monitor(), Some("monitor"));
        assert!(matches!(
            workflow.monitor_metric(&State::new(), "missing"),
            Err(EfError::Workflow(WorkflowError::MissingMonitor { .. }))
        ));
    }

    #[test]
    fn test_fitness_shape_checked() {
        struct Broken;
        impl Module for Broken {}
        impl Problem for Broken {
            fn evaluate(
                &self,
                _ctx: &mut StepContext<'_>,
                local: &LocalState,
                _candidates: &Candidates,
            ) -> EfResult<(Tensor, LocalState)> {
                Ok((vector(vec![0.0]), local.clone()))
            }
        }
        let mut workflow = StdWorkflow::builder(Pso::new(vec![-1.0], vec![1.0], 4).unwrap(), Broken)
            .build()
            .unwrap();
        let state = workflow.init().unwrap();
        assert!(matches!(
            workflow.step(&state),
            Err(EfError::Workflow(WorkflowError::FitnessShape { expected_batch: 4, .. }))
        ));
    }

    #[test]
    fn test_batched_lanes_step_in_lockstep() {
        let mut workflow = pso_workflow(10, 5);
        let init = workflow.init().unwrap();
        let batched = State::stack(&[init.clone(), init.clone(), init]).unwrap();
        let next = workflow.run(&batched, 4).unwrap();
        assert_eq!(next.batch_dims(), &[3]);
        assert_eq!(next.leaf(GENERATION).unwrap(), &vector(vec![4.0, 4.0, 4.0]));

        let lanes = next.unstack().unwrap();
        assert_ne!(
            lanes[0].leaf("algorithm.population").unwrap(),
            lanes[1].leaf("algorithm.population").unwrap()
        );

        let metric = workflow.monitor_metric(&next, "monitor").unwrap();
        assert_eq!(metric.shape(), &[3]);
    }

    #[test]
    fn test_parallel_and_sequential_lanes_agree() {
        let build = |parallel: bool| {
            StdWorkflow::builder(Pso::new(vec![-5.0, -5.0], vec![5.0, 5.0], 12).unwrap(), Sphere::new())
                .monitor(EvalMonitor::new())
                .config(WorkflowConfig::new("lanes").with_seed(9).with_parallel_lanes(parallel))
                .build()
                .unwrap()
        };
        let mut parallel = build(true);
        let mut sequential = build(false);
        let a = parallel.init().unwrap();
        let b = sequential.init().unwrap();
        let a = parallel.run(&State::stack(&[a.clone(), a.clone(), a.clone(), a]).unwrap(), 5).unwrap();
        let b = sequential.run(&State::stack(&[b.clone(), b.clone(), b.clone(), b]).unwrap(), 5).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_run_while_stops_on_predicate() {
        let mut workflow = pso_workflow(6, 2);
        let state = workflow.init().unwrap();
        let out = workflow
            .run_while(&state, 100, |s| Ok(generation(s) < 3.0))
            .unwrap();
        assert_eq!(generation(&out), 3.0);
        let capped = workflow.run_while(&state, 2, |_| Ok(true)).unwrap();
        assert_eq!(generation(&capped), 2.0);
    }

    #[test]
    fn test_batched_run_while_freezes_finished_lanes() {
        let mut workflow = pso_workflow(6, 2);
        let init = workflow.init().unwrap();
        let ahead = init.with_leaf(GENERATION, scalar(2.0)).unwrap();
        let batched = State::stack(&[init, ahead]).unwrap();
        let out = workflow
            .run_while(&batched, 100, |s| Ok(generation(s) < 4.0))
            .unwrap();
        assert_eq!(out.leaf(GENERATION).unwrap(), &vector(vec![4.0, 4.0]));
    }

    #[test]
    fn test_multi_device_placement() {
        let mut workflow = pso_workflow(4, 0);
        workflow.enable_multi_devices(DeviceMesh::gpus(2)).unwrap();
        let state = workflow.init().unwrap();
        assert!(matches!(
            state.placement("algorithm.population"),
            Some(ShardDirective::Split { axis: 0, .. })
        ));
        assert_eq!(
            state.placement("algorithm.global_best_fitness"),
            Some(&ShardDirective::Replicated)
        );
        let next = workflow.step(&state).unwrap();
        assert!(next.is_sharded());

        let mut single = pso_workflow(4, 0);
        let plain = single.init().unwrap();
        let stepped = single.step(&plain).unwrap();
        assert!(!stepped.is_sharded());
        assert_eq!(
            next.leaf("algorithm.population").unwrap(),
            stepped.leaf("algorithm.population").unwrap()
        );

        let mut uneven = pso_workflow(5, 0);
        uneven.enable_multi_devices(DeviceMesh::gpus(2)).unwrap();
        assert!(uneven.init().is_err());
    }

    #[test]
    fn test_sharded_state_survives_stacking() {
        let mut workflow = pso_workflow(4, 0);
        workflow.enable_multi_devices(DeviceMesh::gpus(2)).unwrap();
        let state = workflow.init().unwrap();
        let states = vec![state.clone(), state];
        let stacked = State::stack(&states).unwrap();
        assert!(matches!(
            stacked.placement("algorithm.population"),
            Some(ShardDirective::Split { axis: 1, .. })
        ));
        assert_eq!(workflow.shard(&stacked).unwrap(), stacked);
        assert_eq!(stacked.unstack().unwrap(), states);

        let stepped = workflow.step(&stacked).unwrap();
        assert!(stepped.is_sharded());
        assert_eq!(stepped.batch_dims(), &[2]);
    }

    #[test]
    fn test_workflow_is_a_module() {
        let workflow = pso_workflow(4, 0);
        let tree = ModuleTree::build(&workflow).unwrap();
        assert_eq!(tree.len(), workflow.tree().len());
        assert_eq!(tree.find("monitor").unwrap().ctx.id.0, 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn step_replays_bit_for_bit(
            seed in any::<u64>(),
            pop_size in 1usize..12,
            steps in 0usize..5,
            lanes in 1usize..4,
        ) {
            let mut workflow = pso_workflow(pop_size, seed);
            let init = workflow.init().unwrap();
            let batched = State::stack(&vec![init.clone(); lanes]).unwrap();
            let state = workflow.run(&batched, steps).unwrap();

            let a = workflow.step(&state).unwrap();
            let b = workflow.step(&state).unwrap();
            prop_assert_eq!(&a, &b);

            let mut fresh = pso_workflow(pop_size, seed);
            let replay = fresh.init().unwrap();
            prop_assert_eq!(&replay, &init);
            let replayed = fresh.run(&State::stack(&vec![replay; lanes]).unwrap(), steps + 1).unwrap();
            prop_assert_eq!(replayed, a);
        }
    }
}
