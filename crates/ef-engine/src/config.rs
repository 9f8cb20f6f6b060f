use ef_types::{config_error, DeviceMesh, EfResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Workflow configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    /// Seed for the workflow's root random key.
    pub seed: u64,
    /// Run batched lanes on the rayon pool instead of sequentially.
    pub parallel_lanes: bool,
    /// Device set for multi-device placement. `None` keeps everything on one device.
    pub devices: Option<DeviceMesh>,
}

impl WorkflowConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_parallel_lanes(mut self, parallel: bool) -> Self {
        self.parallel_lanes = parallel;
        self
    }

    pub fn with_devices(mut self, mesh: DeviceMesh) -> Self {
        self.devices = Some(mesh);
        self
    }

    pub fn validate(&self) -> EfResult<()> {
        if self.name.trim().is_empty() {
            return Err(config_error!("workflow name must not be empty"));
        }
        if let Some(mesh) = &self.devices {
            if mesh.is_empty() {
                return Err(config_error!("device mesh for {} has no devices", self.name));
            }
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

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            name: "workflow".to_string(),
            seed: 0,
            parallel_lanes: true,
            devices: None,
        }
    }
}
