//! # ef-hpo
//!
//! Hyper-parameter optimization for EvoFlow.
//!
//! [`HpoProblem`] turns an initialized workflow into a batched problem whose
//! inputs are parameter settings and whose fitness is the inner workflow's
//! metric. [`ParamCodec`] lets a vector-based algorithm drive it, and
//! [`Tuner`] runs grid or random search over a [`SearchSpace`] with trial
//! tracking.

mod codec;
mod config;
mod problem;
mod search;
mod trial;
mod tuner;

pub use codec::ParamCodec;
pub use config::HpoConfig;
pub use problem::{HpoProblem, ParamBatch, INSTANCES};
pub use search::{
    GridSearch, ParameterDef, ParameterKind, ParameterSet, ParameterValue, RandomSearch, SearchSpace,
    SearchStrategy,
};
pub use trial::{
    ObjectiveDirection, StrategyKind, Trial, TrialResult, TrialStatus, TunerConfig, TuningId, TuningRun,
    TuningState,
};
pub use tuner::Tuner;
