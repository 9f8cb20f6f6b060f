//! Device meshes and per-leaf shard directives.
//!
//! Placement is advisory metadata attached to a [`State`](crate::State)
//! snapshot. The container validates that a directive is satisfiable but never
//! moves data itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{EfResult, StructureError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Tpu,
}

/// A single accelerator (or host) on the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub ordinal: usize,
}

impl Device {
    pub fn cpu(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            ordinal,
        }
    }

    pub fn gpu(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            ordinal,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Tpu => "tpu",
        };
        write!(f, "{kind}:{}", self.ordinal)
    }
}

/// Ordered set of devices a workflow may spread its state over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMesh {
    pub devices: Vec<Device>,
}

impl DeviceMesh {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn gpus(count: usize) -> Self {
        Self::new((0..count).map(Device::gpu).collect())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// A mesh of at most one device makes every directive a no-op.
    pub fn is_single(&self) -> bool {
        self.devices.len() <= 1
    }
}

impl Default for DeviceMesh {
    fn default() -> Self {
        Self::new(vec![Device::cpu(0)])
    }
}

/// Where one leaf lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardDirective {
    /// Full copy on every device.
    Replicated,
    /// Contiguous slices along `axis`, one per device, in mesh order.
    Split { axis: usize, devices: Vec<Device> },
}

/// One device's slice of a split leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSlice {
    pub device: Device,
    pub start: usize,
    pub end: usize,
}

impl ShardDirective {
    /// Compute the per-device slices for an axis of length `len`.
    ///
    /// The length must divide evenly across devices.
    pub fn slices(&self, path: &str, len: usize) -> EfResult<Vec<ShardSlice>> {
        match self {
            Self::Replicated => Ok(Vec::new()),
            Self::Split { devices, .. } => {
                if devices.is_empty() {
                    return Err(StructureError::InvalidPlacement {
                        path: path.to_string(),
                        message: "split over an empty device list".into(),
                    }
                    .into());
                }
                if len % devices.len() != 0 {
                    return Err(StructureError::InvalidPlacement {
                        path: path.to_string(),
                        message: format!(
                            "axis length {len} is not divisible by {} devices",
                            devices.len()
                        ),
                    }
                    .into());
                }
                let chunk = len / devices.len();
                Ok(devices
                    .iter()
                    .enumerate()
                    .map(|(i, device)| ShardSlice {
                        device: *device,
                        start: i * chunk,
                        end: (i + 1) * chunk,
                    })
                    .collect())
            }
        }
    }
}

/// Placement request for a whole state: leaves named in `split_axes` are
/// split along the given logical axis, everything else is replicated.
///
/// Axes are logical, i.e. they exclude any batch dimensions a stacked state
/// carries in front.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementSpec {
    pub mesh: DeviceMesh,
    pub split_axes: BTreeMap<String, usize>,
}

impl PlacementSpec {
    pub fn replicated(mesh: DeviceMesh) -> Self {
        Self {
            mesh,
            split_axes: BTreeMap::new(),
        }
    }

    pub fn split_leaf(mut self, qualified: impl Into<String>, axis: usize) -> Self {
        self.split_axes.insert(qualified.into(), axis);
        self
    }

    pub fn is_trivial(&self) -> bool {
        self.mesh.is_single()
    }

    /// Directive for one leaf, with `batch_rank` leading batch axes in front.
    pub fn directive_for(&self, qualified: &str, batch_rank: usize) -> ShardDirective {
        match self.split_axes.get(qualified) {
            Some(axis) if !self.is_trivial() => ShardDirective::Split {
                axis: axis + batch_rank,
                devices: self.mesh.devices.clone(),
            },
            _ => ShardDirective::Replicated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mesh_is_single_cpu() {
        let mesh = DeviceMesh::default();
        assert!(mesh.is_single());
        assert_eq!(mesh.devices[0].to_string(), "cpu:0");
    }

    #[test]
    fn split_slices_are_contiguous() {
        let directive = ShardDirective::Split {
            axis: 0,
            devices: DeviceMesh::gpus(4).devices,
        };
        let slices = directive.slices("algorithm.population", 8).unwrap();
        assert_eq!(slices.len(), 4);
        assert_eq!((slices[0].start, slices[0].end), (0, 2));
        assert_eq!((slices[3].start, slices[3].end), (6, 8));
        assert_eq!(slices[2].device, Device::gpu(2));
    }

    #[test]
    fn uneven_split_rejected() {
        let directive = ShardDirective::Split {
            axis: 0,
            devices: DeviceMesh::gpus(3).devices,
        };
        assert!(directive.slices("algorithm.population", 10).is_err());
    }

    #[test]
    fn single_device_spec_replicates_everything() {
        let spec = PlacementSpec::replicated(DeviceMesh::default()).split_leaf("a.pop", 0);
        assert_eq!(spec.directive_for("a.pop", 0), ShardDirective::Replicated);
    }

    #[test]
    fn batch_rank_offsets_split_axis() {
        let spec = PlacementSpec::replicated(DeviceMesh::gpus(2)).split_leaf("a.pop", 0);
        match spec.directive_for("a.pop", 1) {
            ShardDirective::Split { axis, devices } => {
                assert_eq!(axis, 1);
                assert_eq!(devices.len(), 2);
            }
            other => panic!("expected split, got {other:?}"),
        }
        assert_eq!(spec.directive_for("a.other", 1), ShardDirective::Replicated);
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = PlacementSpec::replicated(DeviceMesh::gpus(2)).split_leaf("a.pop", 0);
        let json = serde_json::to_string(&spec).unwrap();
        let back: PlacementSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
