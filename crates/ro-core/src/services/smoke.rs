use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{OrchestratorError, Result};
use crate::models::{DeployConfig, HealthState};
use crate::services::orchestrator::HealthCheck;
use crate::services::registry::ServiceRegistry;

/// Post-deploy gate for the whole-stack path: an ordered, all-or-nothing
/// checklist. The first failing check short-circuits the rest and names
/// itself in the error.
pub struct SmokeTestRunner<'a, P> {
    probe: &'a P,
    registry: &'a ServiceRegistry,
    config: &'a DeployConfig,
}

impl<'a, P: HealthCheck> SmokeTestRunner<'a, P> {
    pub fn new(probe: &'a P, registry: &'a ServiceRegistry, config: &'a DeployConfig) -> Self {
        Self {
            probe,
            registry,
            config,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.probe_interval_seconds);
        for name in &self.config.smoke.critical_services {
            let spec = self
                .registry
                .get(name)
                .ok_or_else(|| OrchestratorError::ServiceNotFound(name.clone()))?;
            let url = spec.health_url(spec.production_port);
            let state = self
                .probe
                .poll(&url, interval, self.config.probe_max_attempts)
                .await;
            if state != HealthState::Healthy {
                return Err(OrchestratorError::SmokeTest(format!("liveness:{name}")));
            }
            tracing::info!(service = %name, "smoke liveness check passed");
        }

        let smoke = &self.config.smoke;
        let addr = format!("{}:{}", smoke.messaging_host, smoke.messaging_port);
        let timeout = Duration::from_secs(smoke.messaging_timeout_seconds);
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                tracing::info!(%addr, "smoke messaging check passed");
                Ok(())
            }
            _ => Err(OrchestratorError::SmokeTest("messaging".into())),
        }
    }
}
