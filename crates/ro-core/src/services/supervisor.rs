use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};

use crate::error::{OrchestratorError, Result};
use crate::models::{Generation, ProcessHandle, ServiceSpec, StopOutcome};
use crate::services::orchestrator::ProcessControl;
use crate::services::registry::ResolvedCommand;

const STATUS_FILE: &str = "status.json";

/// One live instance: the OS child plus the handle we publish.
struct ProcessEntry {
    child: Child,
    handle: ProcessHandle,
    log_task: tokio::task::JoinHandle<()>,
}

/// Starts and stops service instances. The in-memory handle table covers
/// processes started in this run; `status.json` under the run directory
/// persists every handle so a later invocation can pick up instances this
/// process never spawned and stop them through their pid.
pub struct ProcessSupervisor {
    run_dir: PathBuf,
    processes: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    /// Handles reloaded from a previous invocation. No `Child` exists for
    /// these; stops go through the pid.
    recovered: Arc<RwLock<HashMap<String, ProcessHandle>>>,
}

impl ProcessSupervisor {
    pub fn new(run_dir: PathBuf) -> Self {
        Self {
            run_dir,
            processes: Arc::new(RwLock::new(HashMap::new())),
            recovered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Reload the handles persisted by a previous invocation, discarding any
    /// whose process is gone. The survivors become stoppable through
    /// [`Self::stop_instance`] even though this run never spawned them.
    pub async fn recover(&self) -> Result<Vec<ProcessHandle>> {
        let path = self.run_dir.join(STATUS_FILE);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let handles: Vec<ProcessHandle> = serde_json::from_str(&data)?;

        let mut live = Vec::new();
        {
            let mut recovered = self.recovered.write().await;
            for handle in handles {
                let slot_key = handle.slot_key();
                if is_pid_alive(handle.pid) {
                    recovered.insert(slot_key, handle.clone());
                    live.push(handle);
                } else {
                    tracing::debug!(slot = %slot_key, pid = handle.pid, "dropping dead handle");
                    let _ = tokio::fs::remove_file(self.pid_file(&slot_key)).await;
                }
            }
        }
        self.write_status().await?;
        Ok(live)
    }

    /// Launch the resolved command for `spec` bound to `port`.
    ///
    /// Returns once the OS confirms process creation; readiness is the
    /// health probe's job. Stdout and stderr are captured into a
    /// per-service, per-generation log file, truncated per invocation.
    pub async fn start_instance(
        &self,
        spec: &ServiceSpec,
        command: &ResolvedCommand,
        port: u16,
        generation: Generation,
    ) -> Result<ProcessHandle> {
        tokio::fs::create_dir_all(&self.run_dir).await?;

        let slot_key = format!("{}-{generation}", spec.name);
        let log_path = self.run_dir.join(format!("{slot_key}.log"));
        tokio::fs::write(&log_path, "").await?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command.shell_line);
        cmd.current_dir(&command.working_path);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| OrchestratorError::ProcessStart {
            service: spec.name.clone(),
            detail: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| OrchestratorError::ProcessStart {
            service: spec.name.clone(),
            detail: "process exited before a pid was observed".into(),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            let tx_out = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx_out.send(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx_err = tx;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx_err.send(line);
                }
            });
        }
        let log_task = spawn_log_writer(log_path.clone(), rx);

        let handle = ProcessHandle {
            service: spec.name.clone(),
            pid,
            port,
            log_path,
            started_at: Utc::now(),
            generation,
        };

        let pid_path = self.pid_file(&slot_key);
        tokio::fs::write(&pid_path, format!("{pid}\n")).await?;

        {
            let mut processes = self.processes.write().await;
            if let Some(stale) = processes.insert(
                slot_key.clone(),
                ProcessEntry {
                    child,
                    handle: handle.clone(),
                    log_task,
                },
            ) {
                tracing::warn!(slot = %slot_key, pid = stale.handle.pid, "replaced stale handle");
                stale.log_task.abort();
            }
        }
        self.recovered.write().await.remove(&slot_key);
        self.write_status().await?;
        tracing::info!(service = %spec.name, %generation, port, pid, "started instance");

        Ok(handle)
    }

    /// Stop an instance: graceful signal, 1-second polls for up to
    /// `grace`, then forced kill. A handle with no live `Child` in the table
    /// (started by an earlier invocation) is stopped through its pid instead.
    /// Idempotent — an already-exited handle reports `Terminated`.
    pub async fn stop_instance(&self, handle: &ProcessHandle, grace: Duration) -> StopOutcome {
        let slot_key = handle.slot_key();
        let entry = {
            let mut processes = self.processes.write().await;
            processes.remove(&slot_key)
        };

        let outcome = match entry {
            Some(mut entry) => {
                let outcome = if entry.child.try_wait().ok().flatten().is_some() {
                    StopOutcome::Terminated
                } else {
                    terminate_gracefully(handle.pid);
                    let mut exited = false;
                    for _ in 0..grace.as_secs().max(1) {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        if entry.child.try_wait().ok().flatten().is_some() {
                            exited = true;
                            break;
                        }
                    }
                    if exited {
                        StopOutcome::Terminated
                    } else {
                        tracing::warn!(slot = %slot_key, pid = handle.pid, "grace period expired, killing");
                        let _ = entry.child.kill().await;
                        StopOutcome::ForcedKill
                    }
                };
                entry.log_task.abort();
                outcome
            }
            None => {
                self.recovered.write().await.remove(&slot_key);
                stop_by_pid(handle.pid, grace).await
            }
        };

        let _ = tokio::fs::remove_file(self.pid_file(&slot_key)).await;
        if let Err(e) = self.write_status().await {
            tracing::warn!(error = %e, "failed to persist handle state");
        }
        tracing::info!(slot = %slot_key, ?outcome, "stopped instance");
        outcome
    }

    /// Read-only snapshot of every live handle, recovered ones included.
    pub async fn snapshot(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = {
            let processes = self.processes.read().await;
            processes.values().map(|e| e.handle.clone()).collect()
        };
        {
            let recovered = self.recovered.read().await;
            handles.extend(recovered.values().cloned());
        }
        handles.sort_by(|a, b| a.service.cmp(&b.service));
        handles
    }

    /// Persist the snapshot as JSON under the run directory. Rewritten after
    /// every start and stop; [`Self::recover`] reads it back.
    pub async fn write_status(&self) -> Result<()> {
        let handles = self.snapshot().await;
        let json = serde_json::to_string_pretty(&handles)?;
        tokio::fs::create_dir_all(&self.run_dir).await?;
        tokio::fs::write(self.run_dir.join(STATUS_FILE), json).await?;
        Ok(())
    }

    fn pid_file(&self, slot_key: &str) -> PathBuf {
        self.run_dir.join(format!("{slot_key}.pid"))
    }
}

impl ProcessControl for ProcessSupervisor {
    async fn start(
        &self,
        spec: &ServiceSpec,
        command: &ResolvedCommand,
        port: u16,
        generation: Generation,
    ) -> Result<ProcessHandle> {
        self.start_instance(spec, command, port, generation).await
    }

    async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> StopOutcome {
        self.stop_instance(handle, grace).await
    }

    async fn port_free(&self, port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    async fn recover(&self) -> Result<Vec<ProcessHandle>> {
        self.recover().await
    }
}

/// Stop a process we hold no `Child` for. Same graceful-then-forced shape
/// as the table path, driven by pid liveness.
async fn stop_by_pid(pid: u32, grace: Duration) -> StopOutcome {
    if !is_pid_alive(pid) {
        return StopOutcome::Terminated;
    }
    terminate_gracefully(pid);
    for _ in 0..grace.as_secs().max(1) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !is_pid_alive(pid) {
            return StopOutcome::Terminated;
        }
    }
    tracing::warn!(pid, "grace period expired, killing");
    kill_pid(pid);
    StopOutcome::ForcedKill
}

fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe {
            // Reap first in case the pid is an unwaited child of this
            // process; a zombie would otherwise still answer signal 0.
            let mut status = 0;
            libc::waitpid(pid as i32, &mut status, libc::WNOHANG);
            libc::kill(pid as i32, 0) == 0
        }
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{GetExitCodeProcess, OpenProcess};
        unsafe {
            let handle = OpenProcess(0x1000, 0, pid); // PROCESS_QUERY_LIMITED_INFORMATION
            if handle.is_null() {
                return false;
            }
            let mut code = 0u32;
            let ok = GetExitCodeProcess(handle, &mut code);
            CloseHandle(handle);
            ok != 0 && code == 259 // STILL_ACTIVE
        }
    }
}

fn kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(windows)]
    {
        terminate_gracefully(pid);
    }
}

fn spawn_log_writer(
    log_path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Ok(mut f) = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
            {
                let _ = f.write_all(format!("{line}\n").as_bytes()).await;
            }
        }
    })
}

fn terminate_gracefully(pid: u32) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(windows)]
    {
        // No graceful signal on windows; TerminateProcess is the only path.
        use std::os::windows::io::FromRawHandle;
        unsafe {
            let handle = windows_sys::Win32::System::Threading::OpenProcess(0x0001, 0, pid); // PROCESS_TERMINATE
            if !handle.is_null() {
                windows_sys::Win32::System::Threading::TerminateProcess(handle, 1);
                let _ = std::os::windows::io::OwnedHandle::from_raw_handle(handle as *mut _);
            }
        }
    }
}
