//! Attribute roles and per-component schemas.
//!
//! Each component type declares an explicit [`Schema`] naming every field and
//! its [`AttributeRole`]. The schema is resolved when the module tree is
//! built; nothing is discovered by introspection at run time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::errors::{EfResult, StructureError};
use crate::state::LocalState;
use crate::tensor::Tensor;

/// How a field participates in iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeRole {
    /// Fixed at construction, lives in the component itself, never in State.
    Constant,
    /// Tunable and batchable; captured in State and overridable by HPO.
    Parameter,
    /// Iteration state.
    Mutable,
}

impl AttributeRole {
    /// Whether values of this role are captured in State.
    pub fn is_stateful(self) -> bool {
        !matches!(self, Self::Constant)
    }
}

/// Declaration of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    pub role: AttributeRole,
    /// Default value for parameters; the fixed value for constants.
    pub default: Option<Tensor>,
    /// Axis along which the value is population-sized, if any. Used when
    /// placing state across devices.
    pub population_axis: Option<usize>,
}

impl AttributeSpec {
    /// Declared shape, taken from the default value when present.
    pub fn shape(&self) -> Option<&[usize]> {
        self.default.as_ref().map(|d| d.shape())
    }
}

/// Ordered list of attribute declarations for one component type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    attributes: Vec<AttributeSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.attributes.push(AttributeSpec {
            name: name.into(),
            role: AttributeRole::Constant,
            default: Some(value),
            population_axis: None,
        });
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, default: Tensor) -> Self {
        self.attributes.push(AttributeSpec {
            name: name.into(),
            role: AttributeRole::Parameter,
            default: Some(default),
            population_axis: None,
        });
        self
    }

    pub fn mutable(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(AttributeSpec {
            name: name.into(),
            role: AttributeRole::Mutable,
            default: None,
            population_axis: None,
        });
        self
    }

    /// A mutable field whose leading axis is the population axis.
    pub fn population(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(AttributeSpec {
            name: name.into(),
            role: AttributeRole::Mutable,
            default: None,
            population_axis: Some(0),
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attributes captured in State (parameters and mutables).
    pub fn stateful(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes.iter().filter(|a| a.role.is_stateful())
    }

    pub fn parameters(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes
            .iter()
            .filter(|a| a.role == AttributeRole::Parameter)
    }

    pub fn validate(&self) -> EfResult<()> {
        let mut seen = HashSet::new();
        for attr in &self.attributes {
            if attr.name.is_empty() || attr.name.contains('.') {
                return Err(StructureError::InvalidName {
                    name: attr.name.clone(),
                    reason: "attribute names must be non-empty and contain no '.'".into(),
                }
                .into());
            }
            if !seen.insert(attr.name.as_str()) {
                return Err(StructureError::DuplicateAttribute {
                    name: attr.name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Check that `local` holds exactly the stateful attributes declared here.
    pub fn check_local(&self, path: &str, local: &LocalState) -> EfResult<()> {
        let expected: BTreeSet<&str> = self.stateful().map(|a| a.name.as_str()).collect();
        let actual: BTreeSet<&str> = local.names().collect();
        if expected == actual {
            return Ok(());
        }
        Err(StructureError::SchemaMismatch {
            path: path.to_string(),
            missing: expected.difference(&actual).map(|s| s.to_string()).collect(),
            unexpected: actual.difference(&expected).map(|s| s.to_string()).collect(),
        }
        .into())
    }
}
