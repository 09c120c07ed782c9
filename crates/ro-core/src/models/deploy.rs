use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which slot of a service an instance occupies during a rollout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Generation {
    Shadow,
    Production,
}

impl Generation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Generation::Shadow => "shadow",
            Generation::Production => "production",
        }
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a spawned service instance. Owned by the supervisor; discarded
/// once the process is confirmed terminated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub service: String,
    pub pid: u32,
    pub port: u16,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub generation: Generation,
}

impl ProcessHandle {
    /// Key used for the handle table, PID files, and log files.
    pub fn slot_key(&self) -> String {
        format!("{}-{}", self.service, self.generation)
    }
}

/// Transient probe verdict; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
    TimedOut,
}

/// Result of a graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Terminated,
    ForcedKill,
}

/// States of the per-service rolling protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Idle,
    StartingShadow,
    ProbingShadow,
    CuttingOver,
    StoppingOld,
    StartingProd,
    ProbingProd,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeployOutcome {
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDeployResult {
    pub service: String,
    pub outcome: DeployOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ServiceDeployResult {
    pub fn done(service: &str) -> Self {
        Self {
            service: service.to_string(),
            outcome: DeployOutcome::Done,
            reason: None,
        }
    }

    pub fn failed(service: &str, reason: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            outcome: DeployOutcome::Failed,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BatchOutcome {
    Success,
    Failed,
}

/// Aggregated result of one orchestrator run. Created at batch start,
/// appended to as services complete, immutable after `finish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub tag: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub per_service: Vec<ServiceDeployResult>,
    pub overall: BatchOutcome,
}

impl BatchResult {
    pub fn begin(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            per_service: Vec::new(),
            overall: BatchOutcome::Success,
        }
    }

    pub fn record(&mut self, result: ServiceDeployResult) {
        if result.outcome == DeployOutcome::Failed {
            self.overall = BatchOutcome::Failed;
        }
        self.per_service.push(result);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.overall == BatchOutcome::Success
    }
}
