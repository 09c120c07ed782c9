use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{OrchestratorError, Result};

/// Environment variables every deployment needs regardless of the registry.
pub const REQUIRED_VARS: &[&str] = &[
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "DB_USER",
    "DB_PASSWORD",
    "HMAC_SECRET",
];

/// Top-level deployment configuration, loaded from the registry YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    pub services: Vec<super::ServiceSpec>,
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
    #[serde(default = "default_probe_attempts")]
    pub probe_max_attempts: u32,
    #[serde(default = "default_run_directory")]
    pub run_directory: PathBuf,
    /// Shell command run between stop-all and start-all in stack mode.
    #[serde(default)]
    pub migrate_command: Option<String>,
    pub smoke: SmokeConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

fn default_grace_period() -> u64 {
    10
}

fn default_probe_interval() -> u64 {
    2
}

fn default_probe_attempts() -> u32 {
    15
}

fn default_run_directory() -> PathBuf {
    PathBuf::from(".release-orchestrator")
}

impl DeployConfig {
    pub fn deploy_log_path(&self) -> PathBuf {
        self.run_directory.join("deployments.log")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeConfig {
    /// Services whose liveness gates the whole stack, checked in this order.
    pub critical_services: Vec<String>,
    pub messaging_host: String,
    pub messaging_port: u16,
    #[serde(default = "default_messaging_timeout")]
    pub messaging_timeout_seconds: u64,
}

fn default_messaging_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceConfig {
    #[serde(default = "default_weekday_start")]
    pub weekday_start_hour: u32,
    #[serde(default = "default_weekday_end")]
    pub weekday_end_hour: u32,
    #[serde(default = "default_weekend_start")]
    pub weekend_start_hour: u32,
    #[serde(default = "default_weekend_end")]
    pub weekend_end_hour: u32,
    /// OS-level units that must be active for maintenance to proceed.
    #[serde(default)]
    pub critical_units: Vec<String>,
}

fn default_weekday_start() -> u32 {
    1
}

fn default_weekday_end() -> u32 {
    5
}

fn default_weekend_start() -> u32 {
    0
}

fn default_weekend_end() -> u32 {
    8
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            weekday_start_hour: default_weekday_start(),
            weekday_end_hour: default_weekday_end(),
            weekend_start_hour: default_weekend_start(),
            weekend_end_hour: default_weekend_end(),
            critical_units: Vec::new(),
        }
    }
}

/// Validated process environment. Built once before orchestration starts;
/// a missing required variable fails here, before any process is touched.
#[derive(Debug, Clone)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Capture and validate the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_map(std::env::vars().collect())
    }

    pub fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        let missing: Vec<&str> = REQUIRED_VARS
            .iter()
            .filter(|name| !vars.contains_key(**name))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }
        Ok(Self { vars })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn rollback_on_failure(&self) -> bool {
        self.get("ROLLBACK_ON_FAILURE")
            .map(|v| {
                let v = v.to_ascii_lowercase();
                v == "1" || v == "true" || v == "yes"
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) fn test_environment() -> Environment {
    let vars: HashMap<String, String> = REQUIRED_VARS
        .iter()
        .map(|name| (name.to_string(), format!("test-{}", name.to_lowercase())))
        .collect();
    Environment::from_map(vars).unwrap()
}
