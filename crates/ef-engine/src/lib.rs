// EvoFlow workflow engine
// Steps a module tree's State through ask -> evaluate -> tell with monitor hooks

pub mod config;
pub mod control_flow;
mod hooks;
pub mod lanes;
pub mod workflow;

pub use config::WorkflowConfig;
pub use control_flow::{batched_switch, batched_while_loop, select_state, switch, while_loop};
pub use workflow::{Phase, StdWorkflow, WorkflowBuilder, GENERATION, KEY};
