use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;

use crate::error::{OrchestratorError, Result};

/// Append-only deployment audit log: one line per attempt,
/// `<timestamp>: <tag> <SUCCESS|FAILED>[ — rollback executed]`.
/// Lines are never mutated or deleted.
pub struct DeploymentLog {
    path: PathBuf,
}

impl DeploymentLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn append(&self, tag: &str, success: bool, rollback_executed: bool) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OrchestratorError::DeployLog(e.to_string()))?;
        }
        let outcome = if success { "SUCCESS" } else { "FAILED" };
        let suffix = if rollback_executed {
            " — rollback executed"
        } else {
            ""
        };
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let line = format!("{timestamp}: {tag} {outcome}{suffix}\n");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| OrchestratorError::DeployLog(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| OrchestratorError::DeployLog(e.to_string()))?;
        Ok(())
    }

    /// Tag of the most recent SUCCESS line, if any. Used as the default
    /// rollback target.
    pub async fn last_successful_tag(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| OrchestratorError::DeployLog(e.to_string()))?;
        for line in contents.lines().rev() {
            let mut tokens = line.split_whitespace().skip(1);
            if let (Some(tag), Some("SUCCESS")) = (tokens.next(), tokens.next()) {
                return Ok(Some(tag.to_string()));
            }
        }
        Ok(None)
    }

    pub async fn read_lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| OrchestratorError::DeployLog(e.to_string()))?;
        Ok(contents.lines().map(str::to_string).collect())
    }
}
