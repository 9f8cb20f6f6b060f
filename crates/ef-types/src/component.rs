//! Role traits for the components a workflow composes.
//!
//! Components are stateless: every call receives the node's own
//! [`LocalState`] and returns a new one. The engine substitutes it back into
//! the snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{EfResult, WorkflowError};
use crate::module::{AsModule, Module, NodeContext};
use crate::random::{Rng, RngKey};
use crate::state::{LocalState, State};
use crate::tensor::Tensor;

/// A batch of candidate solutions, leading axis = candidate index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Candidates {
    /// `(pop_size, dim)` numeric batch.
    Dense(Tensor),
    /// Named arrays sharing one leading candidate axis.
    Named(BTreeMap<String, Tensor>),
}

impl Candidates {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dense(_) => "dense",
            Self::Named(_) => "named",
        }
    }

    /// Number of candidates in the batch.
    pub fn len(&self) -> EfResult<usize> {
        match self {
            Self::Dense(t) => t
                .shape()
                .first()
                .copied()
                .ok_or_else(|| input_mismatch("dense candidates need a leading batch axis".into())),
            Self::Named(map) => {
                let mut sizes = map.iter().map(|(name, t)| {
                    t.shape()
                        .first()
                        .copied()
                        .ok_or_else(|| input_mismatch(format!("candidate field {name} has no batch axis")))
                });
                let first = match sizes.next() {
                    Some(size) => size?,
                    None => return Ok(0),
                };
                for size in sizes {
                    let size = size?;
                    if size != first {
                        return Err(input_mismatch(format!(
                            "candidate fields disagree on batch size ({first} vs {size})"
                        )));
                    }
                }
                Ok(first)
            }
        }
    }

    pub fn is_empty(&self) -> EfResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn as_dense(&self) -> EfResult<&Tensor> {
        match self {
            Self::Dense(t) => Ok(t),
            other => Err(WorkflowError::CandidateKind {
                expected: "dense".into(),
                actual: other.kind().into(),
            }
            .into()),
        }
    }

    pub fn as_named(&self) -> EfResult<&BTreeMap<String, Tensor>> {
        match self {
            Self::Named(map) => Ok(map),
            other => Err(WorkflowError::CandidateKind {
                expected: "named".into(),
                actual: other.kind().into(),
            }
            .into()),
        }
    }
}

fn input_mismatch(message: String) -> crate::EfError {
    WorkflowError::InputMismatch { message }.into()
}

/// Per-call context for `ask`, `tell` and `evaluate`.
///
/// The random stream is derived from the workflow key, the generation, the
/// node id, the lane and the stage, so every call site draws independently
/// and reproducibly.
pub struct StepContext<'a> {
    pub node: &'a NodeContext,
    pub generation: u64,
    pub lane: usize,
    rng: Rng,
}

impl<'a> StepContext<'a> {
    pub fn new(node: &'a NodeContext, key: RngKey, generation: u64, lane: usize, stage: u64) -> Self {
        let rng = key
            .fold_in(generation)
            .fold_in(node.id.0 as u64)
            .fold_in(lane as u64)
            .rng(stage);
        Self {
            node,
            generation,
            lane,
            rng,
        }
    }

    pub fn rng(&mut self) -> &mut Rng {
        &mut self.rng
    }
}

/// Search strategy: proposes candidates and learns from their fitness.
pub trait Algorithm: Module + AsModule {
    fn ask(&self, ctx: &mut StepContext<'_>, local: &LocalState) -> EfResult<(Candidates, LocalState)>;

    fn tell(&self, ctx: &mut StepContext<'_>, local: &LocalState, fitness: &Tensor) -> EfResult<LocalState>;

    /// Fixed batch size, when the algorithm has one.
    fn pop_size(&self) -> Option<usize> {
        None
    }
}

/// What a problem accepts as input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSpec {
    /// Dense `(n, dim)` batch; `None` accepts any width.
    Dense { dim: Option<usize> },
    /// Named arrays with the given per-candidate shapes.
    Named(BTreeMap<String, Vec<usize>>),
    Any,
}

impl InputSpec {
    pub fn check(&self, candidates: &Candidates) -> EfResult<()> {
        match (self, candidates) {
            (Self::Any, _) => Ok(()),
            (Self::Dense { dim }, Candidates::Dense(t)) => {
                if t.ndim() != 2 {
                    return Err(input_mismatch(format!(
                        "expected a (n, dim) batch, got shape {:?}",
                        t.shape()
                    )));
                }
                match dim {
                    Some(d) if t.shape()[1] != *d => Err(input_mismatch(format!(
                        "expected candidates of width {d}, got shape {:?}",
                        t.shape()
                    ))),
                    _ => Ok(()),
                }
            }
            (Self::Named(shapes), Candidates::Named(map)) => {
                for name in map.keys() {
                    if !shapes.contains_key(name) {
                        return Err(input_mismatch(format!("unexpected candidate field {name}")));
                    }
                }
                for (name, shape) in shapes {
                    let t = map
                        .get(name)
                        .ok_or_else(|| input_mismatch(format!("missing candidate field {name}")))?;
                    if t.ndim() == 0 || t.shape()[1..] != shape[..] {
                        return Err(input_mismatch(format!(
                            "field {name} has shape {:?}, expected (n, {shape:?})",
                            t.shape()
                        )));
                    }
                }
                candidates.len().map(|_| ())
            }
            (Self::Dense { .. }, other) => Err(input_mismatch(format!(
                "expected dense candidates, got {}",
                other.kind()
            ))),
            (Self::Named(_), other) => Err(input_mismatch(format!(
                "expected named candidates, got {}",
                other.kind()
            ))),
        }
    }
}

/// Objective function over a batch of candidates.
pub trait Problem: Module + AsModule {
    fn input_spec(&self) -> InputSpec {
        InputSpec::Any
    }

    /// Returns one fitness row per candidate: `(n,)` or `(n, objectives)`.
    fn evaluate(
        &self,
        ctx: &mut StepContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
    ) -> EfResult<(Tensor, LocalState)>;
}

/// Points in a step where monitors may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hook {
    Setup,
    PreAsk,
    PostAsk,
    PreEval,
    PostEval,
    PreTell,
    PostTell,
}

impl Hook {
    pub const ALL: [Hook; 7] = [
        Hook::Setup,
        Hook::PreAsk,
        Hook::PostAsk,
        Hook::PreEval,
        Hook::PostEval,
        Hook::PreTell,
        Hook::PostTell,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::PreAsk => "pre_ask",
            Self::PostAsk => "post_ask",
            Self::PreEval => "pre_eval",
            Self::PostEval => "post_eval",
            Self::PreTell => "pre_tell",
            Self::PostTell => "post_tell",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of hooks a monitor subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HookSet(u8);

impl HookSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Hook::ALL.into_iter().collect()
    }

    pub fn with(self, hook: Hook) -> Self {
        Self(self.0 | hook.bit())
    }

    pub fn contains(self, hook: Hook) -> bool {
        self.0 & hook.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Hook> {
        Hook::ALL.into_iter().filter(move |h| self.contains(*h))
    }
}

impl FromIterator<Hook> for HookSet {
    fn from_iter<I: IntoIterator<Item = Hook>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), HookSet::with)
    }
}

/// Read-only view handed to monitor hooks.
pub struct HookContext<'a> {
    pub node: &'a NodeContext,
    /// The full snapshot as of this hook, for inspection only.
    pub state: &'a State,
    pub generation: u64,
    pub lane: usize,
}

/// Observer that runs at selected hooks.
///
/// Each hook receives the monitor's own local state and returns a replacement,
/// or `None` to leave it unchanged. Hooks not listed in [`Monitor::hooks`] are
/// never called.
#[allow(unused_variables)]
pub trait Monitor: Module + AsModule {
    fn hooks(&self) -> HookSet;

    fn setup(&self, ctx: &HookContext<'_>, local: &LocalState) -> EfResult<Option<LocalState>> {
        Ok(None)
    }

    fn pre_ask(&self, ctx: &HookContext<'_>, local: &LocalState) -> EfResult<Option<LocalState>> {
        Ok(None)
    }

    fn post_ask(
        &self,
        ctx: &HookContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
    ) -> EfResult<Option<LocalState>> {
        Ok(None)
    }

    fn pre_eval(
        &self,
        ctx: &HookContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
    ) -> EfResult<Option<LocalState>> {
        Ok(None)
    }

    fn post_eval(
        &self,
        ctx: &HookContext<'_>,
        local: &LocalState,
        candidates: &Candidates,
        fitness: &Tensor,
    ) -> EfResult<Option<LocalState>> {
        Ok(None)
    }

    fn pre_tell(&self, ctx: &HookContext<'_>, local: &LocalState, fitness: &Tensor) -> EfResult<Option<LocalState>> {
        Ok(None)
    }

    fn post_tell(&self, ctx: &HookContext<'_>, local: &LocalState) -> EfResult<Option<LocalState>> {
        Ok(None)
    }

    /// Whether [`Monitor::metric`] yields a value.
    fn provides_metric(&self) -> bool {
        false
    }

    /// Performance metric read from this monitor's local state, if it has one.
    fn metric(&self, local: &LocalState) -> EfResult<Option<Tensor>> {
        Ok(None)
    }
}

/// Pure map from the algorithm's candidate batch to the problem's input.
pub trait SolutionTransform: Send + Sync {
    fn transform(&self, candidates: Candidates) -> EfResult<Candidates>;
}

impl<F> SolutionTransform for F
where
    F: Fn(Candidates) -> EfResult<Candidates> + Send + Sync,
{
    fn transform(&self, candidates: Candidates) -> EfResult<Candidates> {
        self(candidates)
    }
}
