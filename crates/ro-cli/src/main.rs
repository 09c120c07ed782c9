use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};

use ro_core::models::{BatchResult, DeployOutcome, Environment};
use ro_core::services::config_loader::{self, CONFIG_FILENAME};
use ro_core::services::maintenance::{GuardMode, MaintenanceWindowGuard};
use ro_core::services::orchestrator::DeploymentOrchestrator;
use ro_core::services::probe::HealthProbe;
use ro_core::services::supervisor::ProcessSupervisor;

#[derive(Parser)]
#[command(
    name = "release-orchestrator",
    about = "Rolling and whole-stack deployments with bounded rollback"
)]
struct Cli {
    /// Path to the service registry / deployment config.
    #[arg(long, default_value = CONFIG_FILENAME)]
    config: PathBuf,

    /// Also write a debug trace file under the run directory.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a release tag.
    Deploy {
        tag: String,
        #[arg(long, value_enum, default_value_t = Mode::Rolling)]
        mode: Mode,
    },
    /// Restore the previous known-good generation.
    Rollback {
        /// Defaults to the last SUCCESS entry in the deployment log.
        previous_tag: Option<String>,
    },
    /// Wait until every service answers its production health endpoint.
    WaitForHealth {
        /// Total budget in seconds, shared across all services.
        #[arg(default_value_t = 60)]
        timeout_seconds: u64,
    },
    /// Run the post-deploy smoke checklist against the live stack.
    SmokeTest,
    /// Run a maintenance command behind the window and health gate.
    Maintenance {
        /// Downgrade gate failures to warnings and proceed.
        #[arg(long)]
        manual: bool,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Per-service shadow-start, health-gate, cutover, drain.
    Rolling,
    /// Stop all, migrate, start all, smoke test.
    Stack,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = config_loader::load(&cli.config)?;
    let _guard = init_logging(cli.debug, &config.run_directory);

    let exit_code = match run(cli.command, config).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            tracing::error!(error = %e, "operation failed");
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(
    command: Command,
    config: ro_core::models::DeployConfig,
) -> ro_core::error::Result<bool> {
    // Maintenance gates on the host, not the deployment environment.
    let command = match command {
        Command::Maintenance { manual, command } => {
            run_maintenance(config, manual, command).await?;
            return Ok(true);
        }
        other => other,
    };

    let environment = Environment::from_env()?;
    let interval = Duration::from_secs(config.probe_interval_seconds);
    let supervisor = ProcessSupervisor::new(config.run_directory.clone());
    let probe = HealthProbe::new(interval);
    let mut orchestrator = DeploymentOrchestrator::new(config, environment, supervisor, probe)?;
    orchestrator.recover().await?;

    match command {
        Command::Deploy { tag, mode } => {
            let batch = match mode {
                Mode::Rolling => orchestrator.deploy_rolling(&tag).await?,
                Mode::Stack => orchestrator.deploy_stack(&tag).await?,
            };
            print_batch(&batch);
            Ok(batch.succeeded())
        }
        Command::Rollback { previous_tag } => {
            orchestrator.rollback(previous_tag.as_deref()).await?;
            println!("rollback complete");
            Ok(true)
        }
        Command::WaitForHealth { timeout_seconds } => {
            orchestrator.wait_for_health(timeout_seconds).await?;
            println!("all services healthy");
            Ok(true)
        }
        Command::SmokeTest => {
            orchestrator.smoke_test().await?;
            println!("smoke test passed");
            Ok(true)
        }
        Command::Maintenance { .. } => unreachable!("handled above"),
    }
}

async fn run_maintenance(
    config: ro_core::models::DeployConfig,
    manual: bool,
    command: Vec<String>,
) -> ro_core::error::Result<()> {
    let mode = if manual {
        GuardMode::Manual
    } else {
        GuardMode::Automatic
    };
    let guard = MaintenanceWindowGuard::new(config.maintenance.clone(), mode);
    let snapshot = guard.gather_snapshot().await?;
    let warnings = guard.gate(Local::now(), &snapshot)?;
    for warning in warnings {
        eprintln!("warning: {warning}");
    }

    let status = tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .status()
        .await?;
    if !status.success() {
        return Err(ro_core::error::OrchestratorError::Maintenance(format!(
            "command exited with {}",
            status.code().unwrap_or(-1)
        )));
    }
    Ok(())
}

fn print_batch(batch: &BatchResult) {
    for result in &batch.per_service {
        match result.outcome {
            DeployOutcome::Done => println!("  {}: done", result.service),
            DeployOutcome::Failed => println!(
                "  {}: failed ({})",
                result.service,
                result.reason.as_deref().unwrap_or("unknown")
            ),
        }
    }
    let overall = if batch.succeeded() { "SUCCESS" } else { "FAILED" };
    println!("deployment {}: {overall}", batch.tag);
}

/// Stdout logging always; with `--debug` an additional trace file under the
/// run directory. The returned guard must stay alive for the program's
/// duration.
fn init_logging(
    debug: bool,
    run_dir: &std::path::Path,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    if debug {
        let _ = std::fs::create_dir_all(run_dir);
        let file_appender = tracing_appender::rolling::never(run_dir, "debug.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter()).init();
        None
    }
}
