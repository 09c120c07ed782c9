use std::collections::HashMap;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::models::{DeployConfig, Environment, Generation, HealthState, ProcessHandle};
use crate::services::deploy_log::DeploymentLog;
use crate::services::orchestrator::{HealthCheck, ProcessControl};
use crate::services::registry::ServiceRegistry;
use crate::services::smoke::SmokeTestRunner;

/// Restores a previous known-good generation after a failed deployment.
///
/// Rollback is never auto-retried: a failure here is surfaced to the
/// operator as fatal. Every attempt, success or failure, lands in the
/// deployment log.
pub struct RollbackController<'a, S, P> {
    supervisor: &'a S,
    probe: &'a P,
    registry: &'a ServiceRegistry,
    environment: &'a Environment,
    config: &'a DeployConfig,
    log: &'a DeploymentLog,
}

impl<'a, S: ProcessControl, P: HealthCheck> RollbackController<'a, S, P> {
    pub fn new(
        supervisor: &'a S,
        probe: &'a P,
        registry: &'a ServiceRegistry,
        environment: &'a Environment,
        config: &'a DeployConfig,
        log: &'a DeploymentLog,
    ) -> Self {
        Self {
            supervisor,
            probe,
            registry,
            environment,
            config,
            log,
        }
    }

    /// Stop the current generation of every service in `services`, restart
    /// the previous tag's process set, and re-run the smoke gate.
    ///
    /// Returns the restored production handles on success.
    pub async fn rollback(
        &self,
        previous_tag: &str,
        services: &[String],
        current: Vec<ProcessHandle>,
    ) -> Result<HashMap<String, ProcessHandle>> {
        tracing::warn!(previous_tag, count = services.len(), "rolling back");
        let grace = Duration::from_secs(self.config.grace_period_seconds);
        for handle in &current {
            self.supervisor.stop(handle, grace).await;
        }

        let result = self.restore(previous_tag, services).await;
        self.log
            .append(previous_tag, result.is_ok(), true)
            .await?;
        result
    }

    async fn restore(
        &self,
        previous_tag: &str,
        services: &[String],
    ) -> Result<HashMap<String, ProcessHandle>> {
        let interval = Duration::from_secs(self.config.probe_interval_seconds);
        let mut restored = HashMap::new();
        for spec in self.registry.topo_order()? {
            if !services.contains(&spec.name) {
                continue;
            }
            let command = self.registry.resolve(
                &spec.name,
                spec.production_port,
                previous_tag,
                self.environment,
            )?;
            let handle = self
                .supervisor
                .start(spec, &command, spec.production_port, Generation::Production)
                .await
                .map_err(|e| OrchestratorError::Rollback(e.to_string()))?;
            let state = self
                .probe
                .poll(
                    &spec.health_url(spec.production_port),
                    interval,
                    self.config.probe_max_attempts,
                )
                .await;
            if state != HealthState::Healthy {
                return Err(OrchestratorError::Rollback(format!(
                    "restored '{}' did not become healthy",
                    spec.name
                )));
            }
            restored.insert(spec.name.clone(), handle);
        }

        SmokeTestRunner::new(self.probe, self.registry, self.config)
            .run()
            .await
            .map_err(|e| OrchestratorError::Rollback(format!("smoke re-check failed: {e}")))?;

        tracing::info!(previous_tag, "rollback complete");
        Ok(restored)
    }
}
