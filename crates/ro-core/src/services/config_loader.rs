use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::models::DeployConfig;

pub const CONFIG_FILENAME: &str = "release-orchestrator.yaml";

pub fn load(path: &Path) -> Result<DeployConfig> {
    if !path.exists() {
        return Err(OrchestratorError::RegistryNotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    let config: DeployConfig =
        serde_yaml::from_str(&contents).map_err(|e| OrchestratorError::Config(e.to_string()))?;
    if config.services.is_empty() {
        return Err(OrchestratorError::Config(
            "at least one service is required".into(),
        ));
    }
    Ok(config)
}
