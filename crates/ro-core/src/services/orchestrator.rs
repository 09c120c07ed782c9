use std::collections::HashMap;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::models::{
    BatchOutcome, BatchResult, DeployConfig, DeployOutcome, DeployState, Environment, Generation,
    HealthState, ProcessHandle, ServiceDeployResult, ServiceSpec, StopOutcome,
};
use crate::services::deploy_log::DeploymentLog;
use crate::services::registry::{ResolvedCommand, ServiceRegistry};
use crate::services::rollback::RollbackController;
use crate::services::smoke::SmokeTestRunner;

/// Process lifecycle seam. The supervisor implements this against real OS
/// processes; tests inject fakes so the state machine can be exercised
/// transition by transition.
#[allow(async_fn_in_trait)]
pub trait ProcessControl {
    async fn start(
        &self,
        spec: &ServiceSpec,
        command: &ResolvedCommand,
        port: u16,
        generation: Generation,
    ) -> Result<ProcessHandle>;

    /// Graceful-then-forced stop. Idempotent, never an error.
    async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> StopOutcome;

    /// Whether the given local port can currently be bound.
    async fn port_free(&self, port: u16) -> bool;

    /// Handles of still-live instances left behind by a previous invocation.
    async fn recover(&self) -> Result<Vec<ProcessHandle>>;
}

/// Health polling seam, mirror of [`ProcessControl`].
#[allow(async_fn_in_trait)]
pub trait HealthCheck {
    async fn poll(&self, url: &str, interval: Duration, max_attempts: u32) -> HealthState;
}

/// Drives deployments one service at a time, in dependency order.
///
/// Owns the batch-level policy: fail-fast abort, the optional
/// rollback-on-failure hand-off, and the whole-stack stop/migrate/start
/// path with its smoke-test gate.
pub struct DeploymentOrchestrator<S, P> {
    registry: ServiceRegistry,
    environment: Environment,
    config: DeployConfig,
    log: DeploymentLog,
    supervisor: S,
    probe: P,
    /// Current production-slot handle per service. The only mutable shared
    /// state in a run; written exclusively by this control thread.
    production: HashMap<String, ProcessHandle>,
}

impl<S: ProcessControl, P: HealthCheck> DeploymentOrchestrator<S, P> {
    pub fn new(
        config: DeployConfig,
        environment: Environment,
        supervisor: S,
        probe: P,
    ) -> Result<Self> {
        let registry = ServiceRegistry::new(config.services.clone())?;
        let log = DeploymentLog::new(config.deploy_log_path());
        Ok(Self {
            registry,
            environment,
            config,
            log,
            supervisor,
            probe,
            production: HashMap::new(),
        })
    }

    /// Reload production handles that survived a previous invocation, so
    /// cutover and rollback can stop processes this run did not start.
    /// A leftover shadow instance from an interrupted run is stopped here.
    pub async fn recover(&mut self) -> Result<()> {
        for handle in self.supervisor.recover().await? {
            match handle.generation {
                Generation::Production => {
                    self.production.insert(handle.service.clone(), handle);
                }
                Generation::Shadow => {
                    tracing::warn!(service = %handle.service, "stopping leftover shadow instance");
                    self.supervisor.stop(&handle, Duration::ZERO).await;
                }
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn deploy_log(&self) -> &DeploymentLog {
        &self.log
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.grace_period_seconds)
    }

    fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.config.probe_interval_seconds)
    }

    /// Rolling deployment: every service walks the shadow → probe → cutover
    /// → drain protocol; the first failure aborts the remaining services.
    pub async fn deploy_rolling(&mut self, tag: &str) -> Result<BatchResult> {
        let order: Vec<ServiceSpec> = self.registry.topo_order()?.into_iter().cloned().collect();
        tracing::info!(tag, services = order.len(), "starting rolling deployment");

        let mut batch = BatchResult::begin(tag);
        let mut failed = false;
        for spec in &order {
            if failed {
                batch.record(ServiceDeployResult::failed(
                    &spec.name,
                    "not attempted (fail-fast abort)",
                ));
                continue;
            }
            let result = self.deploy_service(spec, tag).await;
            failed = result.outcome == DeployOutcome::Failed;
            batch.record(result);
        }

        let mut rolled_back = false;
        if failed && self.environment.rollback_on_failure() {
            match self.rollback_promoted(&batch).await {
                Ok(executed) => rolled_back = executed,
                Err(e) => {
                    self.log.append(tag, false, false).await?;
                    return Err(e);
                }
            }
        }

        batch.finish();
        self.log.append(tag, batch.succeeded(), rolled_back).await?;
        tracing::info!(tag, success = batch.succeeded(), "rolling deployment finished");
        Ok(batch)
    }

    /// One service through the rolling protocol. Always terminates in
    /// `Done` or `Failed`; a failure leaves the previous production
    /// instance (if any) untouched unless cutover had already begun.
    async fn deploy_service(&mut self, spec: &ServiceSpec, tag: &str) -> ServiceDeployResult {
        let shadow_port = spec.shadow_port();
        let mut state = DeployState::Idle;
        let mut shadow: Option<ProcessHandle> = None;
        let mut failure: Option<String> = None;

        loop {
            tracing::debug!(service = %spec.name, ?state, "state");
            state = match state {
                DeployState::Idle => DeployState::StartingShadow,

                DeployState::StartingShadow => {
                    match self.start_instance(spec, shadow_port, Generation::Shadow, tag).await {
                        Ok(handle) => {
                            shadow = Some(handle);
                            DeployState::ProbingShadow
                        }
                        Err(e) => {
                            failure = Some(e.to_string());
                            DeployState::Failed
                        }
                    }
                }

                DeployState::ProbingShadow => {
                    let url = spec.health_url(shadow_port);
                    match self
                        .probe
                        .poll(&url, self.probe_interval(), self.config.probe_max_attempts)
                        .await
                    {
                        HealthState::Healthy => DeployState::CuttingOver,
                        _ => {
                            // Kill the unvalidated shadow; the old production
                            // instance keeps serving.
                            if let Some(handle) = shadow.take() {
                                self.supervisor.stop(&handle, Duration::ZERO).await;
                            }
                            failure = Some(
                                OrchestratorError::HealthTimeout(spec.name.clone()).to_string(),
                            );
                            DeployState::Failed
                        }
                    }
                }

                DeployState::CuttingOver => {
                    if self.production.contains_key(&spec.name) {
                        DeployState::StoppingOld
                    } else {
                        // First deploy: nothing to cut over from.
                        DeployState::StartingProd
                    }
                }

                DeployState::StoppingOld => {
                    if let Some(old) = self.production.remove(&spec.name) {
                        let outcome = self.supervisor.stop(&old, self.grace()).await;
                        tracing::info!(service = %spec.name, ?outcome, "old instance stopped");
                    }
                    DeployState::StartingProd
                }

                DeployState::StartingProd => {
                    // The validated shadow is drained; the build restarts on
                    // the production port so logs and handles stay indexed
                    // by generation.
                    if let Some(handle) = shadow.take() {
                        self.supervisor.stop(&handle, self.grace()).await;
                    }
                    if !self.supervisor.port_free(spec.production_port).await {
                        failure = Some(
                            OrchestratorError::BindConflict(spec.production_port).to_string(),
                        );
                        DeployState::Failed
                    } else {
                        match self
                            .start_instance(spec, spec.production_port, Generation::Production, tag)
                            .await
                        {
                            Ok(handle) => {
                                self.production.insert(spec.name.clone(), handle);
                                DeployState::ProbingProd
                            }
                            Err(e) => {
                                failure = Some(e.to_string());
                                DeployState::Failed
                            }
                        }
                    }
                }

                DeployState::ProbingProd => {
                    let url = spec.health_url(spec.production_port);
                    match self
                        .probe
                        .poll(&url, self.probe_interval(), self.config.probe_max_attempts)
                        .await
                    {
                        HealthState::Healthy => DeployState::Done,
                        _ => {
                            // The port must never stay bound to an
                            // unverified process.
                            if let Some(handle) = self.production.remove(&spec.name) {
                                self.supervisor.stop(&handle, Duration::ZERO).await;
                            }
                            failure = Some(
                                OrchestratorError::HealthTimeout(spec.name.clone()).to_string(),
                            );
                            DeployState::Failed
                        }
                    }
                }

                DeployState::Done => {
                    tracing::info!(service = %spec.name, "service deployed");
                    return ServiceDeployResult::done(&spec.name);
                }

                DeployState::Failed => {
                    let reason = failure.unwrap_or_else(|| "unknown failure".into());
                    tracing::error!(service = %spec.name, %reason, "service deployment failed");
                    return ServiceDeployResult::failed(&spec.name, reason);
                }
            };
        }
    }

    /// Whole-stack deployment: stop everything, migrate, start everything,
    /// then gate on the smoke test. A smoke failure hands control to the
    /// rollback controller.
    pub async fn deploy_stack(&mut self, tag: &str) -> Result<BatchResult> {
        let order: Vec<ServiceSpec> = self.registry.topo_order()?.into_iter().cloned().collect();
        tracing::info!(tag, services = order.len(), "starting stack deployment");
        let mut batch = BatchResult::begin(tag);

        let old: Vec<ProcessHandle> = self.production.drain().map(|(_, h)| h).collect();
        for handle in &old {
            self.supervisor.stop(handle, self.grace()).await;
        }

        if let Some(command) = self.config.migrate_command.clone() {
            if let Err(e) = self.run_migration(&command).await {
                self.log.append(tag, false, false).await?;
                return Err(e);
            }
        }

        let mut failure: Option<String> = None;
        for spec in &order {
            if failure.is_some() {
                batch.record(ServiceDeployResult::failed(
                    &spec.name,
                    "not attempted (fail-fast abort)",
                ));
                continue;
            }
            match self.start_and_confirm(spec, tag).await {
                Ok(()) => batch.record(ServiceDeployResult::done(&spec.name)),
                Err(e) => {
                    failure = Some(e.to_string());
                    batch.record(ServiceDeployResult::failed(&spec.name, e.to_string()));
                }
            }
        }

        if failure.is_none() {
            if let Err(e) = SmokeTestRunner::new(&self.probe, &self.registry, &self.config)
                .run()
                .await
            {
                failure = Some(e.to_string());
            }
        }

        batch.finish();
        match failure {
            None => {
                self.log.append(tag, true, false).await?;
                tracing::info!(tag, "stack deployment succeeded");
                Ok(batch)
            }
            Some(reason) => {
                batch.overall = BatchOutcome::Failed;
                tracing::error!(tag, %reason, "stack deployment failed");
                let service_names: Vec<String> =
                    order.iter().map(|s| s.name.clone()).collect();
                match self.rollback_services(&service_names).await {
                    Ok(rolled_back) => {
                        self.log.append(tag, false, rolled_back).await?;
                        Ok(batch)
                    }
                    Err(e) => {
                        self.log.append(tag, false, false).await?;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Restore the previous known-good generation. Without an explicit
    /// target, the last SUCCESS entry in the deployment log is used.
    pub async fn rollback(&mut self, previous_tag: Option<&str>) -> Result<()> {
        let tag = match previous_tag {
            Some(tag) => tag.to_string(),
            None => self.log.last_successful_tag().await?.ok_or_else(|| {
                OrchestratorError::Rollback("no previous successful tag in the log".into())
            })?,
        };
        let services: Vec<String> = self
            .registry
            .specs()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        let current: Vec<ProcessHandle> = self.production.drain().map(|(_, h)| h).collect();
        let controller = RollbackController::new(
            &self.supervisor,
            &self.probe,
            &self.registry,
            &self.environment,
            &self.config,
            &self.log,
        );
        let restored = controller.rollback(&tag, &services, current).await?;
        self.production.extend(restored);
        Ok(())
    }

    /// Run the smoke-test checklist against the live stack.
    pub async fn smoke_test(&self) -> Result<()> {
        SmokeTestRunner::new(&self.probe, &self.registry, &self.config)
            .run()
            .await
    }

    /// Probe every service's production health endpoint, sharing one
    /// `timeout_seconds` budget across the whole registry. A service reached
    /// after the budget is spent still gets a single attempt.
    pub async fn wait_for_health(&self, timeout_seconds: u64) -> Result<()> {
        let interval = self.probe_interval();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_seconds);
        for spec in self.registry.specs() {
            let url = spec.health_url(spec.production_port);
            let remaining = deadline.duration_since(tokio::time::Instant::now());
            let attempts = (remaining.as_secs() / interval.as_secs().max(1)).max(1) as u32;
            let state = self.probe.poll(&url, interval, attempts).await;
            if state != HealthState::Healthy {
                return Err(OrchestratorError::HealthTimeout(spec.name.clone()));
            }
        }
        Ok(())
    }

    async fn start_instance(
        &self,
        spec: &ServiceSpec,
        port: u16,
        generation: Generation,
        tag: &str,
    ) -> Result<ProcessHandle> {
        let command = self
            .registry
            .resolve(&spec.name, port, tag, &self.environment)?;
        self.supervisor.start(spec, &command, port, generation).await
    }

    /// Stack-mode start: bind-check, start the production slot, confirm it
    /// reports healthy.
    async fn start_and_confirm(&mut self, spec: &ServiceSpec, tag: &str) -> Result<()> {
        if !self.supervisor.port_free(spec.production_port).await {
            return Err(OrchestratorError::BindConflict(spec.production_port));
        }
        let handle = self
            .start_instance(spec, spec.production_port, Generation::Production, tag)
            .await?;
        self.production.insert(spec.name.clone(), handle);

        let url = spec.health_url(spec.production_port);
        let state = self
            .probe
            .poll(&url, self.probe_interval(), self.config.probe_max_attempts)
            .await;
        if state != HealthState::Healthy {
            if let Some(handle) = self.production.remove(&spec.name) {
                self.supervisor.stop(&handle, Duration::ZERO).await;
            }
            return Err(OrchestratorError::HealthTimeout(spec.name.clone()));
        }
        Ok(())
    }

    /// Hand the already-promoted services of a failed rolling batch to the
    /// rollback controller.
    async fn rollback_promoted(&mut self, batch: &BatchResult) -> Result<bool> {
        let promoted: Vec<String> = batch
            .per_service
            .iter()
            .filter(|r| r.outcome == DeployOutcome::Done)
            .map(|r| r.service.clone())
            .collect();
        if promoted.is_empty() {
            return Ok(false);
        }
        let Some(previous) = self.log.last_successful_tag().await? else {
            tracing::warn!("rollback requested but no previous successful tag exists");
            return Ok(false);
        };
        let current: Vec<ProcessHandle> = promoted
            .iter()
            .filter_map(|name| self.production.remove(name))
            .collect();
        let controller = RollbackController::new(
            &self.supervisor,
            &self.probe,
            &self.registry,
            &self.environment,
            &self.config,
            &self.log,
        );
        let restored = controller.rollback(&previous, &promoted, current).await?;
        self.production.extend(restored);
        Ok(true)
    }

    async fn rollback_services(&mut self, services: &[String]) -> Result<bool> {
        let Some(previous) = self.log.last_successful_tag().await? else {
            tracing::warn!("smoke test failed but no previous successful tag exists");
            return Ok(false);
        };
        let current: Vec<ProcessHandle> = self.production.drain().map(|(_, h)| h).collect();
        let controller = RollbackController::new(
            &self.supervisor,
            &self.probe,
            &self.registry,
            &self.environment,
            &self.config,
            &self.log,
        );
        let restored = controller
            .rollback(&previous, services, current)
            .await?;
        self.production.extend(restored);
        Ok(true)
    }

    async fn run_migration(&self, command: &str) -> Result<()> {
        tracing::info!(command, "running migration");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| OrchestratorError::ProcessStart {
                service: "migrate".into(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::ProcessStart {
                service: "migrate".into(),
                detail: format!(
                    "exit {}: {stderr}",
                    output.status.code().unwrap_or(-1)
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use chrono::Utc;

    use crate::models::config::test_environment;
    use crate::models::{MaintenanceConfig, SmokeConfig, REQUIRED_VARS};

    #[derive(Default)]
    struct FakeSupervisor {
        calls: Mutex<Vec<String>>,
        fail_start: HashSet<String>,
        stubborn: HashSet<String>,
        busy_ports: HashSet<u16>,
        recovered: Vec<ProcessHandle>,
        next_pid: AtomicU32,
    }

    impl FakeSupervisor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn call_index(&self, needle: &str) -> Option<usize> {
            self.calls().iter().position(|c| c.contains(needle))
        }
    }

    impl ProcessControl for FakeSupervisor {
        async fn start(
            &self,
            spec: &ServiceSpec,
            command: &ResolvedCommand,
            port: u16,
            generation: Generation,
        ) -> Result<ProcessHandle> {
            let slot = format!("{}-{generation}", spec.name);
            self.calls
                .lock()
                .unwrap()
                .push(format!("start {slot} port={port} cmd={}", command.shell_line));
            if self.fail_start.contains(&slot) {
                return Err(OrchestratorError::ProcessStart {
                    service: spec.name.clone(),
                    detail: "injected".into(),
                });
            }
            Ok(ProcessHandle {
                service: spec.name.clone(),
                pid: 100 + self.next_pid.fetch_add(1, Ordering::SeqCst),
                port,
                log_path: PathBuf::from(format!("{slot}.log")),
                started_at: Utc::now(),
                generation,
            })
        }

        async fn stop(&self, handle: &ProcessHandle, _grace: Duration) -> StopOutcome {
            let slot = handle.slot_key();
            self.calls
                .lock()
                .unwrap()
                .push(format!("stop {slot} pid={}", handle.pid));
            if self.stubborn.contains(&slot) {
                StopOutcome::ForcedKill
            } else {
                StopOutcome::Terminated
            }
        }

        async fn port_free(&self, port: u16) -> bool {
            !self.busy_ports.contains(&port)
        }

        async fn recover(&self) -> Result<Vec<ProcessHandle>> {
            self.calls.lock().unwrap().push("recover".into());
            Ok(self.recovered.clone())
        }
    }

    #[derive(Default)]
    struct FakeProbe {
        unhealthy: Vec<String>,
        unhealthy_once: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
    }

    impl HealthCheck for FakeProbe {
        async fn poll(&self, url: &str, _interval: Duration, _max_attempts: u32) -> HealthState {
            self.calls.lock().unwrap().push(url.to_string());
            let mut once = self.unhealthy_once.lock().unwrap();
            if let Some(i) = once.iter().position(|u| url.contains(u.as_str())) {
                once.remove(i);
                return HealthState::TimedOut;
            }
            if self.unhealthy.iter().any(|u| url.contains(u.as_str())) {
                HealthState::TimedOut
            } else {
                HealthState::Healthy
            }
        }
    }

    fn spec(name: &str, port: u16, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.into(),
            production_port: port,
            shadow_port_offset: 10000,
            working_path: ".".into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            health_path: "/health".into(),
            start_command: "run ${TAG}".into(),
            env: vec![],
        }
    }

    fn config(
        run_dir: &std::path::Path,
        services: Vec<ServiceSpec>,
        critical: &[&str],
        messaging_port: u16,
    ) -> DeployConfig {
        DeployConfig {
            services,
            grace_period_seconds: 5,
            probe_interval_seconds: 1,
            probe_max_attempts: 3,
            run_directory: run_dir.to_path_buf(),
            migrate_command: None,
            smoke: SmokeConfig {
                critical_services: critical.iter().map(|s| s.to_string()).collect(),
                messaging_host: "127.0.0.1".into(),
                messaging_port,
                messaging_timeout_seconds: 1,
            },
            maintenance: MaintenanceConfig::default(),
        }
    }

    fn environment_with_rollback() -> Environment {
        let mut vars: std::collections::HashMap<String, String> = REQUIRED_VARS
            .iter()
            .map(|n| (n.to_string(), "x".to_string()))
            .collect();
        vars.insert("ROLLBACK_ON_FAILURE".into(), "true".into());
        Environment::from_map(vars).unwrap()
    }

    fn old_handle(name: &str, port: u16) -> ProcessHandle {
        ProcessHandle {
            service: name.into(),
            pid: 1,
            port,
            log_path: PathBuf::from(format!("{name}-production.log")),
            started_at: Utc::now(),
            generation: Generation::Production,
        }
    }

    async fn messaging_listener() -> (tokio::net::TcpListener, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn shadow_probe_timeout_leaves_old_instance_serving() {
        // Scenario: the shadow never reports healthy.
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![spec("api", 24100, &[])], &["api"], 1);
        let probe = FakeProbe {
            unhealthy: vec![":34100".into()],
            ..Default::default()
        };
        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            probe,
        )
        .unwrap();
        orchestrator
            .production
            .insert("api".into(), old_handle("api", 24100));

        let batch = orchestrator.deploy_rolling("v2").await.unwrap();
        assert!(!batch.succeeded());
        assert_eq!(batch.per_service[0].outcome, DeployOutcome::Failed);

        let calls = orchestrator.supervisor.calls();
        assert!(calls.iter().any(|c| c.starts_with("stop api-shadow")));
        assert!(!calls.iter().any(|c| c.starts_with("stop api-production")));
        // Old instance still registered as the production slot.
        assert_eq!(orchestrator.production["api"].pid, 1);

        let lines = orchestrator.log.read_lines().await.unwrap();
        assert!(lines[0].ends_with("v2 FAILED"));
    }

    #[tokio::test]
    async fn healthy_shadow_cuts_over_and_drains_old_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![spec("api", 24100, &[])], &["api"], 1);
        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            FakeProbe::default(),
        )
        .unwrap();
        orchestrator
            .production
            .insert("api".into(), old_handle("api", 24100));

        let batch = orchestrator.deploy_rolling("v2").await.unwrap();
        assert!(batch.succeeded());

        let sup = &orchestrator.supervisor;
        let start_shadow = sup.call_index("start api-shadow").unwrap();
        let stop_old = sup.call_index("stop api-production pid=1").unwrap();
        let stop_shadow = sup.call_index("stop api-shadow").unwrap();
        let start_prod = sup.call_index("start api-production").unwrap();
        assert!(start_shadow < stop_old);
        assert!(stop_old < stop_shadow);
        assert!(stop_shadow < start_prod);

        // Production slot now held by the new generation.
        assert_ne!(orchestrator.production["api"].pid, 1);
        let lines = orchestrator.log.read_lines().await.unwrap();
        assert!(lines[0].ends_with("v2 SUCCESS"));
    }

    #[tokio::test]
    async fn stubborn_old_instance_is_force_killed_once_then_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![spec("api", 24100, &[])], &["api"], 1);
        let supervisor = FakeSupervisor {
            stubborn: HashSet::from(["api-production".to_string()]),
            ..Default::default()
        };
        let mut orchestrator =
            DeploymentOrchestrator::new(config, test_environment(), supervisor, FakeProbe::default())
                .unwrap();
        orchestrator
            .production
            .insert("api".into(), old_handle("api", 24100));

        let batch = orchestrator.deploy_rolling("v2").await.unwrap();
        assert!(batch.succeeded());

        let stops: Vec<String> = orchestrator
            .supervisor
            .calls()
            .into_iter()
            .filter(|c| c.contains("stop api-production pid=1"))
            .collect();
        assert_eq!(stops.len(), 1);
        assert!(orchestrator
            .supervisor
            .call_index("start api-production")
            .is_some());
    }

    #[tokio::test]
    async fn recovered_production_instance_is_cut_over_like_any_other() {
        // A handle persisted by an earlier invocation must be stoppable in
        // this one, or every redeploy after the first would bind-conflict.
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![spec("api", 24100, &[])], &["api"], 1);
        let supervisor = FakeSupervisor {
            recovered: vec![
                old_handle("api", 24100),
                ProcessHandle {
                    service: "api".into(),
                    pid: 2,
                    port: 34100,
                    log_path: PathBuf::from("api-shadow.log"),
                    started_at: Utc::now(),
                    generation: Generation::Shadow,
                },
            ],
            ..Default::default()
        };
        let mut orchestrator =
            DeploymentOrchestrator::new(config, test_environment(), supervisor, FakeProbe::default())
                .unwrap();
        orchestrator.recover().await.unwrap();

        // The leftover shadow is cleared right away; the production handle
        // takes its slot.
        assert_eq!(orchestrator.production["api"].pid, 1);
        assert!(orchestrator
            .supervisor
            .call_index("stop api-shadow pid=2")
            .is_some());

        let batch = orchestrator.deploy_rolling("v2").await.unwrap();
        assert!(batch.succeeded());
        assert!(orchestrator
            .supervisor
            .call_index("stop api-production pid=1")
            .is_some());
        assert_ne!(orchestrator.production["api"].pid, 1);
    }

    #[tokio::test]
    async fn first_deploy_skips_cutover() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![spec("api", 24100, &[])], &["api"], 1);
        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            FakeProbe::default(),
        )
        .unwrap();

        let batch = orchestrator.deploy_rolling("v1").await.unwrap();
        assert!(batch.succeeded());
        let calls = orchestrator.supervisor.calls();
        assert!(!calls.iter().any(|c| c.contains("stop api-production")));
        assert!(orchestrator.production.contains_key("api"));
    }

    #[tokio::test]
    async fn bind_conflict_fails_the_service() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![spec("api", 24100, &[])], &["api"], 1);
        let supervisor = FakeSupervisor {
            busy_ports: HashSet::from([24100]),
            ..Default::default()
        };
        let mut orchestrator =
            DeploymentOrchestrator::new(config, test_environment(), supervisor, FakeProbe::default())
                .unwrap();

        let batch = orchestrator.deploy_rolling("v1").await.unwrap();
        assert!(!batch.succeeded());
        let reason = batch.per_service[0].reason.as_deref().unwrap();
        assert!(reason.contains("port 24100"));
        assert!(!orchestrator
            .supervisor
            .calls()
            .iter()
            .any(|c| c.contains("start api-production")));
    }

    #[tokio::test]
    async fn fail_fast_skips_services_after_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let services = vec![
            spec("api", 24100, &[]),
            spec("worker", 24200, &["api"]),
            spec("gateway", 24300, &["worker"]),
        ];
        let config = config(dir.path(), services, &["api"], 1);
        // worker's shadow (24200 + 10000) never becomes healthy
        let probe = FakeProbe {
            unhealthy: vec![":34200".into()],
            ..Default::default()
        };
        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            probe,
        )
        .unwrap();

        let batch = orchestrator.deploy_rolling("v1").await.unwrap();
        assert_eq!(batch.per_service[0].outcome, DeployOutcome::Done);
        assert_eq!(batch.per_service[1].outcome, DeployOutcome::Failed);
        assert_eq!(batch.per_service[2].outcome, DeployOutcome::Failed);
        assert_eq!(
            batch.per_service[2].reason.as_deref(),
            Some("not attempted (fail-fast abort)")
        );
        assert!(!orchestrator
            .supervisor
            .calls()
            .iter()
            .any(|c| c.contains("start gateway-shadow")));
    }

    #[tokio::test]
    async fn rollback_on_failure_restores_promoted_services() {
        let dir = tempfile::tempdir().unwrap();
        let (_listener, messaging_port) = messaging_listener().await;
        let services = vec![spec("api", 24100, &[]), spec("worker", 24200, &["api"])];
        let config = config(dir.path(), services, &["api"], messaging_port);
        let log_path = config.deploy_log_path();
        DeploymentLog::new(log_path).append("v1", true, false).await.unwrap();

        let probe = FakeProbe {
            unhealthy: vec![":34200".into()],
            ..Default::default()
        };
        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            environment_with_rollback(),
            FakeSupervisor::default(),
            probe,
        )
        .unwrap();

        let batch = orchestrator.deploy_rolling("v2").await.unwrap();
        assert!(!batch.succeeded());

        // api was promoted to v2, then restored to v1.
        let calls = orchestrator.supervisor.calls();
        let v2_start = calls
            .iter()
            .position(|c| c.contains("start api-production port=24100 cmd=run v2"))
            .unwrap();
        let v1_restore = calls
            .iter()
            .position(|c| c.contains("start api-production port=24100 cmd=run v1"))
            .unwrap();
        assert!(v2_start < v1_restore);

        let lines = orchestrator.log.read_lines().await.unwrap();
        assert!(lines.iter().any(|l| l.ends_with("v1 SUCCESS — rollback executed")));
        assert!(lines.last().unwrap().ends_with("v2 FAILED — rollback executed"));
    }

    #[tokio::test]
    async fn stack_smoke_failure_triggers_rollback_to_previous_tag() {
        let dir = tempfile::tempdir().unwrap();
        let (_listener, messaging_port) = messaging_listener().await;
        let config = config(
            dir.path(),
            vec![spec("api", 24100, &[])],
            &["api"],
            messaging_port,
        );
        let log_path = config.deploy_log_path();
        DeploymentLog::new(log_path).append("v1", true, false).await.unwrap();

        // First liveness check of the new generation fails; the restored
        // generation probes healthy.
        let probe = FakeProbe {
            unhealthy_once: Mutex::new(vec![":24100".into()]),
            ..Default::default()
        };
        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            probe,
        )
        .unwrap();

        let batch = orchestrator.deploy_stack("v2").await.unwrap();
        assert!(!batch.succeeded());

        let calls = orchestrator.supervisor.calls();
        assert!(calls.iter().any(|c| c.contains("cmd=run v1")));
        let lines = orchestrator.log.read_lines().await.unwrap();
        assert!(lines
            .iter()
            .any(|l| l.ends_with("v2 FAILED — rollback executed")));
    }

    #[tokio::test]
    async fn failed_rollback_is_fatal_and_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        // Messaging port with no listener: the smoke gate and the rollback
        // re-check both fail.
        let messaging_port = {
            let (listener, port) = messaging_listener().await;
            drop(listener);
            port
        };
        let config = config(
            dir.path(),
            vec![spec("api", 24100, &[])],
            &["api"],
            messaging_port,
        );
        let log_path = config.deploy_log_path();
        DeploymentLog::new(log_path).append("v1", true, false).await.unwrap();

        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            FakeProbe::default(),
        )
        .unwrap();

        let err = orchestrator.deploy_stack("v2").await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Rollback(_)));

        // Exactly one restore attempt for the previous tag.
        let restores: Vec<String> = orchestrator
            .supervisor
            .calls()
            .into_iter()
            .filter(|c| c.contains("cmd=run v1"))
            .collect();
        assert_eq!(restores.len(), 1);
        let lines = orchestrator.log.read_lines().await.unwrap();
        assert!(lines
            .iter()
            .any(|l| l.ends_with("v1 FAILED — rollback executed")));
    }

    #[tokio::test]
    async fn rollback_twice_to_same_tag_converges() {
        let dir = tempfile::tempdir().unwrap();
        let (_listener, messaging_port) = messaging_listener().await;
        let config = config(
            dir.path(),
            vec![spec("api", 24100, &[])],
            &["api"],
            messaging_port,
        );
        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            FakeProbe::default(),
        )
        .unwrap();

        orchestrator.rollback(Some("v1")).await.unwrap();
        let first_pid = orchestrator.production["api"].pid;
        orchestrator.rollback(Some("v1")).await.unwrap();

        // Same generation both times: a fresh process of the same tag on
        // the production port, with the first one stopped in between.
        let calls = orchestrator.supervisor.calls();
        let restores: Vec<&String> = calls.iter().filter(|c| c.contains("cmd=run v1")).collect();
        assert_eq!(restores.len(), 2);
        assert!(calls
            .iter()
            .any(|c| c.contains(&format!("stop api-production pid={first_pid}"))));
        assert_eq!(orchestrator.production["api"].port, 24100);
    }

    #[tokio::test]
    async fn rollback_without_history_or_argument_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![spec("api", 24100, &[])], &["api"], 1);
        let mut orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            FakeProbe::default(),
        )
        .unwrap();
        let err = orchestrator.rollback(None).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Rollback(_)));
    }

    #[tokio::test]
    async fn wait_for_health_reports_the_unhealthy_service() {
        let dir = tempfile::tempdir().unwrap();
        let services = vec![spec("api", 24100, &[]), spec("worker", 24200, &["api"])];
        let config = config(dir.path(), services, &["api"], 1);
        let probe = FakeProbe {
            unhealthy: vec![":24200".into()],
            ..Default::default()
        };
        let orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            probe,
        )
        .unwrap();

        let err = orchestrator.wait_for_health(10).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::HealthTimeout(ref s) if s == "worker"));
    }

    /// Records the attempt budget it was handed, then burns the worst-case
    /// wall clock for it.
    struct SlowProbe {
        budgets: Mutex<Vec<u32>>,
    }

    impl HealthCheck for SlowProbe {
        async fn poll(&self, _url: &str, interval: Duration, max_attempts: u32) -> HealthState {
            self.budgets.lock().unwrap().push(max_attempts);
            tokio::time::sleep(interval * max_attempts).await;
            HealthState::Healthy
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_health_budget_is_shared_across_services() {
        let dir = tempfile::tempdir().unwrap();
        let services = vec![spec("api", 24100, &[]), spec("worker", 24200, &["api"])];
        let config = config(dir.path(), services, &["api"], 1);
        let orchestrator = DeploymentOrchestrator::new(
            config,
            test_environment(),
            FakeSupervisor::default(),
            SlowProbe {
                budgets: Mutex::new(Vec::new()),
            },
        )
        .unwrap();

        orchestrator.wait_for_health(10).await.unwrap();

        // The first service consumed the whole window; the second is left
        // with a single attempt rather than a fresh ten-second budget.
        let budgets = orchestrator.probe.budgets.lock().unwrap().clone();
        assert_eq!(budgets, vec![10, 1]);
    }
}
