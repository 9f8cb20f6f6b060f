//! Immutable, path-addressed state snapshots.
//!
//! A [`State`] maps node paths to that node's [`LocalState`]. Local states are
//! held behind `Arc`, so replacing one node's slice shares every other slice
//! with the previous snapshot instead of copying it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::errors::{EfError, EfResult, StructureError};
use crate::placement::{PlacementSpec, ShardDirective};
use crate::tensor::{stack_leading, unstack_leading, Tensor};

/// Join a node path and an attribute name into a qualified leaf path.
pub fn qualify(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

/// Split a qualified leaf path into `(node path, attribute name)`.
pub fn split_qualified(qualified: &str) -> (&str, &str) {
    qualified.rsplit_once('.').unwrap_or(("", qualified))
}

/// Human-readable form of a node path; the root path is empty.
pub fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(Tensor),
    /// A complete snapshot owned by this node, e.g. a wrapped workflow's state.
    State(Box<State>),
}

impl Value {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::State(_) => None,
        }
    }

    pub fn as_state(&self) -> Option<&State> {
        match self {
            Self::State(s) => Some(s),
            Self::Tensor(_) => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::State(_) => "state",
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Self::Tensor(tensor)
    }
}

impl From<State> for Value {
    fn from(state: State) -> Self {
        Self::State(Box::new(state))
    }
}

/// Attribute values belonging to exactly one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    values: BTreeMap<String, Value>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn tensor(&self, name: &str) -> EfResult<&Tensor> {
        let value = self.get(name).ok_or_else(|| StructureError::MissingAttribute {
            name: name.to_string(),
        })?;
        value.as_tensor().ok_or_else(|| {
            StructureError::ValueKind {
                name: name.to_string(),
                expected: "tensor".into(),
            }
            .into()
        })
    }

    pub fn nested(&self, name: &str) -> EfResult<&State> {
        let value = self.get(name).ok_or_else(|| StructureError::MissingAttribute {
            name: name.to_string(),
        })?;
        value.as_state().ok_or_else(|| {
            StructureError::ValueKind {
                name: name.to_string(),
                expected: "nested state".into(),
            }
            .into()
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Snapshot of every node's local state at one point in time.
///
/// `batch_dims` lists the leading axes added by [`State::stack`], outermost
/// first. Every tensor leaf carries these axes in front of its logical shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    nodes: BTreeMap<String, Arc<LocalState>>,
    batch_dims: Vec<usize>,
    placement: BTreeMap<String, ShardDirective>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used while assembling a fresh snapshot.
    pub fn with_node(mut self, path: impl Into<String>, local: LocalState) -> Self {
        self.nodes.insert(path.into(), Arc::new(local));
        self
    }

    pub fn resolve(&self, path: &str) -> EfResult<&LocalState> {
        self.nodes
            .get(path)
            .map(Arc::as_ref)
            .ok_or_else(|| not_found(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Replace one node's slice. All other slices are shared with `self`.
    pub fn update(&self, path: &str, local: LocalState) -> EfResult<State> {
        if !self.nodes.contains_key(path) {
            return Err(not_found(path));
        }
        let mut next = self.clone();
        next.nodes.insert(path.to_string(), Arc::new(local));
        Ok(next)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn batch_dims(&self) -> &[usize] {
        &self.batch_dims
    }

    /// Size of the outermost batch axis, if stacked.
    pub fn batch_size(&self) -> Option<usize> {
        self.batch_dims.first().copied()
    }

    pub fn is_batched(&self) -> bool {
        !self.batch_dims.is_empty()
    }

    /// Whether `self` and `other` hold the very same allocation for `path`.
    pub fn shares_node(&self, other: &State, path: &str) -> bool {
        match (self.nodes.get(path), other.nodes.get(path)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Look up a tensor leaf by qualified path (`node.attr`, or `attr` at the root).
    pub fn leaf(&self, qualified: &str) -> EfResult<&Tensor> {
        let (path, name) = split_qualified(qualified);
        let local = self.resolve(path)?;
        match local.get(name) {
            Some(Value::Tensor(t)) => Ok(t),
            Some(_) => Err(StructureError::ValueKind {
                name: qualified.to_string(),
                expected: "tensor".into(),
            }
            .into()),
            None => Err(StructureError::AttributeNotFound {
                path: display_path(path).to_string(),
                name: name.to_string(),
            }
            .into()),
        }
    }

    /// Replace an existing tensor leaf.
    pub fn with_leaf(&self, qualified: &str, value: Tensor) -> EfResult<State> {
        self.leaf(qualified)?;
        let (path, name) = split_qualified(qualified);
        let mut local = self.resolve(path)?.clone();
        local.insert(name, value);
        self.update(path, local)
    }

    /// All tensor leaves at this level, keyed by qualified path.
    pub fn leaves(&self) -> impl Iterator<Item = (String, &Tensor)> {
        self.nodes.iter().flat_map(|(path, local)| {
            local
                .iter()
                .filter_map(move |(name, value)| value.as_tensor().map(|t| (qualify(path, name), t)))
        })
    }

    /// Combine homogeneous states along a new leading axis of size `states.len()`.
    pub fn stack(states: &[State]) -> EfResult<State> {
        let first = states.first().ok_or(StructureError::EmptyStack)?;
        for (i, other) in states.iter().enumerate().skip(1) {
            if other.batch_dims != first.batch_dims {
                return Err(stack_mismatch(format!(
                    "state {i} has batch dims {:?}, expected {:?}",
                    other.batch_dims, first.batch_dims
                )));
            }
            let a: BTreeSet<&str> = first.paths().collect();
            let b: BTreeSet<&str> = other.paths().collect();
            if a != b {
                return Err(stack_mismatch(format!(
                    "state {i} has paths {b:?}, expected {a:?}"
                )));
            }
            if other.placement != first.placement {
                return Err(stack_mismatch(format!(
                    "state {i} has a different placement"
                )));
            }
        }

        let mut nodes = BTreeMap::new();
        for (path, local) in &first.nodes {
            let mut stacked = LocalState::new();
            for (name, value) in local.iter() {
                let column = states
                    .iter()
                    .map(|s| {
                        s.nodes[path].get(name).ok_or_else(|| {
                            stack_mismatch(format!(
                                "attribute {} missing in some states",
                                qualify(path, name)
                            ))
                        })
                    })
                    .collect::<EfResult<Vec<&Value>>>()?;
                stacked.insert(name, stack_column(&qualify(path, name), value, &column)?);
            }
            for s in states.iter().skip(1) {
                if s.nodes[path].len() != local.len() {
                    return Err(stack_mismatch(format!(
                        "node {} has differing attribute names",
                        display_path(path)
                    )));
                }
            }
            nodes.insert(path.clone(), Arc::new(stacked));
        }

        let mut batch_dims = Vec::with_capacity(first.batch_dims.len() + 1);
        batch_dims.push(states.len());
        batch_dims.extend_from_slice(&first.batch_dims);
        let placement = first
            .placement
            .iter()
            .map(|(leaf, directive)| (leaf.clone(), shift_directive(directive, true)))
            .collect();
        Ok(State {
            nodes,
            batch_dims,
            placement,
        })
    }

    /// Inverse of [`State::stack`]: split along the outermost batch axis.
    pub fn unstack(&self) -> EfResult<Vec<State>> {
        let n = self.batch_size().ok_or(StructureError::NotBatched)?;
        let inner_dims = self.batch_dims[1..].to_vec();
        let mut lanes: Vec<BTreeMap<String, LocalState>> = vec![BTreeMap::new(); n];

        for (path, local) in &self.nodes {
            for lane in lanes.iter_mut() {
                lane.insert(path.clone(), LocalState::new());
            }
            for (name, value) in local.iter() {
                let parts: Vec<Value> = match value {
                    Value::Tensor(t) => unstack_leading(t)?.into_iter().map(Value::from).collect(),
                    Value::State(s) => s.unstack()?.into_iter().map(Value::from).collect(),
                };
                if parts.len() != n {
                    return Err(StructureError::ShapeMismatch {
                        context: format!("batch axis of {}", qualify(path, name)),
                        expected: vec![n],
                        actual: vec![parts.len()],
                    }
                    .into());
                }
                for (lane, part) in lanes.iter_mut().zip(parts) {
                    if let Some(slot) = lane.get_mut(path) {
                        slot.insert(name, part);
                    }
                }
            }
        }

        let placement: BTreeMap<String, ShardDirective> = self
            .placement
            .iter()
            .map(|(leaf, directive)| (leaf.clone(), shift_directive(directive, false)))
            .collect();
        Ok(lanes
            .into_iter()
            .map(|nodes| State {
                nodes: nodes.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
                batch_dims: inner_dims.clone(),
                placement: placement.clone(),
            })
            .collect())
    }

    /// Attach per-leaf placement directives. A single-device spec leaves the
    /// state untouched.
    pub fn shard(&self, spec: &PlacementSpec) -> EfResult<State> {
        if spec.is_trivial() {
            return Ok(self.clone());
        }
        for qualified in spec.split_axes.keys() {
            self.leaf(qualified)?;
        }
        let batch_rank = self.batch_dims.len();
        let mut placement = BTreeMap::new();
        for (qualified, tensor) in self.leaves() {
            let directive = spec.directive_for(&qualified, batch_rank);
            if let ShardDirective::Split { axis, .. } = &directive {
                let len = tensor.shape().get(*axis).copied().ok_or_else(|| {
                    EfError::from(StructureError::InvalidPlacement {
                        path: qualified.clone(),
                        message: format!("axis {axis} out of range for rank {}", tensor.ndim()),
                    })
                })?;
                directive.slices(&qualified, len)?;
            }
            placement.insert(qualified, directive);
        }
        let mut next = self.clone();
        next.placement = placement;
        Ok(next)
    }

    pub fn placement(&self, qualified: &str) -> Option<&ShardDirective> {
        self.placement.get(qualified)
    }

    pub fn is_sharded(&self) -> bool {
        self.placement
            .values()
            .any(|d| matches!(d, ShardDirective::Split { .. }))
    }

    pub fn to_json(&self) -> EfResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> EfResult<State> {
        Ok(serde_json::from_str(json)?)
    }
}

fn not_found(path: &str) -> EfError {
    StructureError::PathNotFound {
        path: display_path(path).to_string(),
    }
    .into()
}

/// Move a split axis across the outermost batch axis. A split along the
/// batch axis itself leaves every unstacked lane whole.
fn shift_directive(directive: &ShardDirective, outward: bool) -> ShardDirective {
    match directive {
        ShardDirective::Split { axis, devices } if outward => ShardDirective::Split {
            axis: axis + 1,
            devices: devices.clone(),
        },
        ShardDirective::Split { axis, devices } if *axis > 0 => ShardDirective::Split {
            axis: axis - 1,
            devices: devices.clone(),
        },
        _ => ShardDirective::Replicated,
    }
}

fn stack_mismatch(message: String) -> EfError {
    StructureError::StackMismatch { message }.into()
}

fn stack_column(qualified: &str, first: &Value, column: &[&Value]) -> EfResult<Value> {
    match first {
        Value::Tensor(head) => {
            let mut tensors = Vec::with_capacity(column.len());
            for value in column {
                let t = value.as_tensor().ok_or_else(|| {
                    stack_mismatch(format!("{qualified} mixes {} and state values", first.kind()))
                })?;
                if t.shape() != head.shape() {
                    return Err(StructureError::ShapeMismatch {
                        context: qualified.to_string(),
                        expected: head.shape().to_vec(),
                        actual: t.shape().to_vec(),
                    }
                    .into());
                }
                tensors.push(t.clone());
            }
            Ok(Value::Tensor(stack_leading(&tensors)?))
        }
        Value::State(_) => {
            let nested = column
                .iter()
                .map(|value| {
                    value.as_state().cloned().ok_or_else(|| {
                        stack_mismatch(format!("{qualified} mixes {} and tensor values", first.kind()))
                    })
                })
                .collect::<EfResult<Vec<State>>>()?;
            Ok(Value::from(State::stack(&nested)?))
        }
    }
}
