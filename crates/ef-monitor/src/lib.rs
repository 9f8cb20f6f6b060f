//! Monitors for EvoFlow workflows.
//!
//! Monitors observe the step protocol through hooks and keep everything they
//! record in their own local state, so a monitor's history is batched,
//! checkpointed and reproduced along with the rest of the workflow.

pub mod eval;
pub mod events;
pub mod hpo_fitness;
pub mod indicators;

pub use eval::{EvalMonitor, EvalMonitorConfig};
pub use events::{EventLevel, MonitorEvent, MonitorEventKind};
pub use hpo_fitness::HpoFitnessMonitor;
pub use indicators::{mask_non_finite_rows, Igd, Indicator};
