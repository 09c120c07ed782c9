use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("service '{0}' not found in registry")]
    ServiceNotFound(String),

    #[error("registry file not found at {0}")]
    RegistryNotFound(PathBuf),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("failed to start '{service}': {detail}")]
    ProcessStart { service: String, detail: String },

    #[error("health probe for '{0}' exhausted its attempts")]
    HealthTimeout(String),

    #[error("port {0} still bound after old instance stop")]
    BindConflict(u16),

    #[error("smoke test check '{0}' failed")]
    SmokeTest(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("deployment log failure: {0}")]
    DeployLog(String),

    #[error("maintenance gate: {0}")]
    Maintenance(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
