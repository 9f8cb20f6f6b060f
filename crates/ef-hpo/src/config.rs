use ef_types::{EfResult, HpoError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for wrapping a workflow as a hyper-parameter problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpoConfig {
    /// Inner steps run per evaluation.
    pub iterations: usize,
    /// Hyper-parameter settings evaluated together in one call.
    pub num_instances: usize,
    /// Start every evaluation from the initial state instead of the state the
    /// previous evaluation left behind.
    pub copy_init_state: bool,
    /// Monitor whose metric is returned. Defaults to the first monitor that
    /// exposes one.
    pub metric_monitor: Option<String>,
}

impl HpoConfig {
    pub fn new(iterations: usize, num_instances: usize) -> Self {
        Self {
            iterations,
            num_instances,
            ..Self::default()
        }
    }

    pub fn with_copy_init_state(mut self, copy: bool) -> Self {
        self.copy_init_state = copy;
        self
    }

    pub fn with_metric_monitor(mut self, name: impl Into<String>) -> Self {
        self.metric_monitor = Some(name.into());
        self
    }

    pub fn validate(&self) -> EfResult<()> {
        if self.iterations == 0 {
            return Err(HpoError::InvalidConfig {
                message: "iterations must be positive".into(),
            }
            .into());
        }
        if self.num_instances == 0 {
            return Err(HpoError::InvalidConfig {
                message: "num_instances must be positive".into(),
            }
            .into());
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> EfResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EfResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

impl Default for HpoConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            num_instances: 1,
            copy_init_state: true,
            metric_monitor: None,
        }
    }
}
