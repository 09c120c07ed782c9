use chrono::{DateTime, Datelike, Local, Timelike, Weekday};

use crate::error::{OrchestratorError, Result};
use crate::models::MaintenanceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Deferred/blocked decisions abort the operation.
    Automatic,
    /// Decisions are downgraded to warnings and the operation proceeds.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowDecision {
    Allowed,
    Deferred(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrecheckDecision {
    Allowed,
    Blocked(String),
}

/// Point-in-time view of the host, gathered once per gate evaluation so the
/// threshold checks stay pure.
#[derive(Debug, Clone)]
pub struct SystemSnapshot {
    pub load_average: f64,
    pub cpu_cores: usize,
    pub disk_used_percent: u8,
    pub memory_used_percent: u8,
    pub inactive_units: Vec<String>,
}

const DISK_CRITICAL_PERCENT: u8 = 95;
const DISK_WARNING_PERCENT: u8 = 85;
const MEMORY_WARNING_PERCENT: u8 = 90;

/// Gates non-deployment maintenance on wall-clock window and host health.
/// Shares the abort conventions of the rollout path but is independent of it.
pub struct MaintenanceWindowGuard {
    config: MaintenanceConfig,
    mode: GuardMode,
}

impl MaintenanceWindowGuard {
    pub fn new(config: MaintenanceConfig, mode: GuardMode) -> Self {
        Self { config, mode }
    }

    /// Compare the current hour against the configured window. The window
    /// is wider on weekends.
    pub fn check_window(&self, now: DateTime<Local>) -> WindowDecision {
        let weekend = matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
        let (start, end) = if weekend {
            (self.config.weekend_start_hour, self.config.weekend_end_hour)
        } else {
            (self.config.weekday_start_hour, self.config.weekday_end_hour)
        };
        let hour = now.hour();
        if hour >= start && hour < end {
            WindowDecision::Allowed
        } else {
            WindowDecision::Deferred(format!(
                "hour {hour} outside the {}-{start}:00..{end}:00 window",
                if weekend { "weekend" } else { "weekday" }
            ))
        }
    }

    /// Threshold checks over a snapshot. Blocking conditions: load above
    /// `cpuCores * 2`, disk above 95%, a critical unit down. Disk above 85%
    /// and memory above 90% are warnings only.
    pub fn precheck(&self, snapshot: &SystemSnapshot) -> (PrecheckDecision, Vec<String>) {
        let mut warnings = Vec::new();

        let load_limit = (snapshot.cpu_cores * 2) as f64;
        if snapshot.load_average > load_limit {
            return (
                PrecheckDecision::Blocked(format!(
                    "load average {:.2} exceeds limit {load_limit:.0}",
                    snapshot.load_average
                )),
                warnings,
            );
        }

        if snapshot.disk_used_percent > DISK_CRITICAL_PERCENT {
            return (
                PrecheckDecision::Blocked(format!(
                    "disk usage {}% above critical threshold {DISK_CRITICAL_PERCENT}%",
                    snapshot.disk_used_percent
                )),
                warnings,
            );
        }
        if snapshot.disk_used_percent > DISK_WARNING_PERCENT {
            warnings.push(format!(
                "disk usage {}% above warning threshold {DISK_WARNING_PERCENT}%",
                snapshot.disk_used_percent
            ));
        }

        if snapshot.memory_used_percent > MEMORY_WARNING_PERCENT {
            warnings.push(format!(
                "memory usage {}% above warning threshold {MEMORY_WARNING_PERCENT}%",
                snapshot.memory_used_percent
            ));
        }

        if !snapshot.inactive_units.is_empty() {
            return (
                PrecheckDecision::Blocked(format!(
                    "critical units not active: {}",
                    snapshot.inactive_units.join(", ")
                )),
                warnings,
            );
        }

        (PrecheckDecision::Allowed, warnings)
    }

    /// Evaluate both gates. In automatic mode any deferred/blocked decision
    /// is an error; in manual mode it becomes a warning and the operation
    /// proceeds. Returns the warnings to surface.
    pub fn gate(&self, now: DateTime<Local>, snapshot: &SystemSnapshot) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if let WindowDecision::Deferred(reason) = self.check_window(now) {
            match self.mode {
                GuardMode::Automatic => {
                    return Err(OrchestratorError::Maintenance(format!("deferred: {reason}")))
                }
                GuardMode::Manual => warnings.push(format!("window override: {reason}")),
            }
        }

        let (decision, mut precheck_warnings) = self.precheck(snapshot);
        warnings.append(&mut precheck_warnings);
        if let PrecheckDecision::Blocked(reason) = decision {
            match self.mode {
                GuardMode::Automatic => {
                    return Err(OrchestratorError::Maintenance(format!("blocked: {reason}")))
                }
                GuardMode::Manual => warnings.push(format!("precheck override: {reason}")),
            }
        }

        for warning in &warnings {
            tracing::warn!(%warning, "maintenance gate");
        }
        Ok(warnings)
    }

    /// Gather a live snapshot of the host.
    #[cfg(unix)]
    pub async fn gather_snapshot(&self) -> Result<SystemSnapshot> {
        let loadavg = tokio::fs::read_to_string("/proc/loadavg").await?;
        let load_average = loadavg
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| OrchestratorError::Maintenance("unparseable /proc/loadavg".into()))?;

        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await?;
        let memory_used_percent = parse_memory_used_percent(&meminfo)
            .ok_or_else(|| OrchestratorError::Maintenance("unparseable /proc/meminfo".into()))?;

        let disk_used_percent = root_disk_used_percent()?;

        let mut inactive_units = Vec::new();
        for unit in &self.config.critical_units {
            if !unit_is_active(unit).await {
                inactive_units.push(unit.clone());
            }
        }

        Ok(SystemSnapshot {
            load_average,
            cpu_cores,
            disk_used_percent,
            memory_used_percent,
            inactive_units,
        })
    }

    #[cfg(not(unix))]
    pub async fn gather_snapshot(&self) -> Result<SystemSnapshot> {
        Err(OrchestratorError::Maintenance(
            "system prechecks are only supported on unix hosts".into(),
        ))
    }
}

#[cfg(unix)]
fn root_disk_used_percent() -> Result<u8> {
    let path = std::ffi::CString::new("/").expect("static path");
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(OrchestratorError::Maintenance("statvfs on / failed".into()));
    }
    if stat.f_blocks == 0 {
        return Ok(0);
    }
    let used = stat.f_blocks.saturating_sub(stat.f_bavail) as f64;
    Ok(((used / stat.f_blocks as f64) * 100.0).round() as u8)
}

fn parse_memory_used_percent(meminfo: &str) -> Option<u8> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((((total - available) / total) * 100.0).round() as u8)
}

#[cfg(unix)]
async fn unit_is_active(unit: &str) -> bool {
    tokio::process::Command::new("systemctl")
        .args(["is-active", "--quiet", unit])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
