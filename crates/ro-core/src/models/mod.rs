pub mod config;
pub mod deploy;
pub mod service;

pub use config::{DeployConfig, Environment, MaintenanceConfig, SmokeConfig, REQUIRED_VARS};
pub use deploy::{
    BatchOutcome, BatchResult, DeployOutcome, DeployState, Generation, HealthState, ProcessHandle,
    ServiceDeployResult, StopOutcome,
};
pub use service::ServiceSpec;
