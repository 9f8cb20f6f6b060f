//! Module tree: stable node identities and paths.
//!
//! A component declares its children through [`Module::submodules`]. Building a
//! [`ModuleTree`] walks those declarations in pre-order, assigning ids
//! `0, 1, 2, ...` and dotted paths from the root (the root itself has the
//! empty path). The same definition always yields the same ids and paths.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::attributes::{AttributeSpec, Schema};
use crate::errors::{EfResult, StructureError};
use crate::random::{Rng, RngKey, INIT_STREAM};
use crate::state::{display_path, qualify, LocalState, State};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Identity handed to every component call so it can find its own slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeContext {
    pub id: NodeId,
    pub path: String,
}

impl NodeContext {
    pub fn root() -> Self {
        Self {
            id: NodeId(0),
            path: String::new(),
        }
    }

    /// Qualified path of one of this node's attributes.
    pub fn qualify(&self, name: &str) -> String {
        qualify(&self.path, name)
    }

    pub fn child_path(&self, name: &str) -> String {
        qualify(&self.path, name)
    }

    pub fn display_path(&self) -> &str {
        display_path(&self.path)
    }
}

/// A component that can live in a module tree.
pub trait Module: Send + Sync {
    fn schema(&self) -> Schema {
        Schema::new()
    }

    /// Named children, in a fixed order.
    fn submodules(&self) -> Vec<(&str, &dyn Module)> {
        Vec::new()
    }

    /// Initial values for this node's mutable attributes. Parameter defaults
    /// from the schema are filled in by the tree; a value returned here for a
    /// parameter overrides its default.
    fn init_state(&self, _ctx: &NodeContext, _rng: &mut Rng) -> EfResult<LocalState> {
        Ok(LocalState::new())
    }
}

/// Upcast helper so role traits (`Algorithm`, `Problem`, `Monitor`) can hand
/// themselves to the tree as plain modules.
pub trait AsModule {
    fn as_module(&self) -> &dyn Module;
}

impl<T: Module> AsModule for T {
    fn as_module(&self) -> &dyn Module {
        self
    }
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub ctx: NodeContext,
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub schema: Schema,
}

#[derive(Debug, Clone)]
pub struct ModuleTree {
    nodes: Vec<TreeNode>,
}

impl ModuleTree {
    pub fn build(root: &dyn Module) -> EfResult<Self> {
        let mut nodes = Vec::new();
        build_node(root, String::new(), String::new(), None, &mut nodes)?;
        Ok(Self { nodes })
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id.0)
    }

    pub fn find(&self, path: &str) -> EfResult<&TreeNode> {
        self.nodes
            .iter()
            .find(|n| n.ctx.path == path)
            .ok_or_else(|| {
                StructureError::PathNotFound {
                    path: display_path(path).to_string(),
                }
                .into()
            })
    }

    pub fn context(&self, path: &str) -> EfResult<&NodeContext> {
        self.find(path).map(|n| &n.ctx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every parameter in the tree, keyed by qualified path, in node order.
    pub fn parameters(&self) -> Vec<(String, &AttributeSpec)> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.schema
                    .parameters()
                    .map(move |spec| (node.ctx.qualify(&spec.name), spec))
            })
            .collect()
    }

    /// Mutable leaves with a population axis, keyed by qualified path.
    pub fn population_leaves(&self) -> Vec<(String, usize)> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.schema
                    .stateful()
                    .filter_map(move |spec| spec.population_axis.map(|axis| (node.ctx.qualify(&spec.name), axis)))
            })
            .collect()
    }

    /// Produce the first state for `root`, which must be the module this tree
    /// was built from.
    pub fn init_state(&self, root: &dyn Module, key: RngKey) -> EfResult<State> {
        let mut modules = Vec::with_capacity(self.nodes.len());
        collect_modules(root, &mut modules);
        if modules.len() != self.nodes.len() {
            return Err(crate::internal_error!(
                "module tree has {} nodes but definition yields {}",
                self.nodes.len(),
                modules.len()
            ));
        }

        let mut state = State::new();
        for (node, module) in self.nodes.iter().zip(modules) {
            let mut local = LocalState::new();
            for spec in node.schema.parameters() {
                if let Some(default) = &spec.default {
                    local.insert(spec.name.clone(), default.clone());
                }
            }
            let mut rng = key.fold_in(node.ctx.id.0 as u64).rng(INIT_STREAM);
            for (name, value) in module.init_state(&node.ctx, &mut rng)?.iter() {
                local.insert(name, value.clone());
            }
            node.schema.check_local(node.ctx.display_path(), &local)?;
            state = state.with_node(node.ctx.path.clone(), local);
        }
        Ok(state)
    }
}

fn validate_name(name: &str) -> EfResult<()> {
    if name.is_empty() || name.contains('.') {
        return Err(StructureError::InvalidName {
            name: name.to_string(),
            reason: "child names must be non-empty and contain no '.'".into(),
        }
        .into());
    }
    Ok(())
}

fn build_node(
    module: &dyn Module,
    name: String,
    path: String,
    parent: Option<NodeId>,
    nodes: &mut Vec<TreeNode>,
) -> EfResult<NodeId> {
    let schema = module.schema();
    schema.validate()?;
    let id = NodeId(nodes.len());
    let ctx = NodeContext { id, path };
    nodes.push(TreeNode {
        ctx: ctx.clone(),
        name,
        parent,
        children: Vec::new(),
        schema,
    });

    let mut seen = HashSet::new();
    for (child_name, child) in module.submodules() {
        validate_name(child_name)?;
        if !seen.insert(child_name) {
            return Err(StructureError::DuplicateChild {
                parent: ctx.display_path().to_string(),
                name: child_name.to_string(),
            }
            .into());
        }
        let child_id = build_node(
            child,
            child_name.to_string(),
            ctx.child_path(child_name),
            Some(id),
            nodes,
        )?;
        nodes[id.0].children.push(child_id);
    }
    Ok(id)
}

fn collect_modules<'a>(module: &'a dyn Module, out: &mut Vec<&'a dyn Module>) {
    out.push(module);
    for (_, child) in module.submodules() {
        collect_modules(child, out);
    }
}
