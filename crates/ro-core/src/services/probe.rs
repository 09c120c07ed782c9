use std::time::Duration;

use crate::models::HealthState;
use crate::services::orchestrator::HealthCheck;

/// Polls an HTTP health endpoint at a fixed interval until it answers 2xx
/// or the attempt budget runs out. No backoff — callers size their timeouts
/// as `max_attempts * interval`.
pub struct HealthProbe {
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new(interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(interval)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub async fn poll_url(&self, url: &str, interval: Duration, max_attempts: u32) -> HealthState {
        for attempt in 1..=max_attempts {
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(url, attempt, "healthy");
                    return HealthState::Healthy;
                }
                Ok(response) => {
                    tracing::debug!(url, attempt, status = %response.status(), "not ready");
                }
                Err(e) => {
                    tracing::debug!(url, attempt, error = %e, "unreachable");
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }
        tracing::warn!(url, max_attempts, "health probe timed out");
        HealthState::TimedOut
    }
}

impl HealthCheck for HealthProbe {
    async fn poll(&self, url: &str, interval: Duration, max_attempts: u32) -> HealthState {
        self.poll_url(url, interval, max_attempts).await
    }
}
