//! overseer: automation control plane binary
//!
//! Usage:
//!   overseer              - Start server mode (HTTP API + job ingestion + maintenance)
//!   overseer --list-jobs  - Print every known job as JSON and exit
//!   overseer --reconcile  - Reconcile finished jobs into the store and exit
//!   overseer --help       - Show help

use std::sync::Arc;

use ov_core::Config;
use ov_schedule::{MaintenanceTarget, ScheduleConfig, Scheduler};
use ov_supervisor::{ControlPlane, Supervisor};
use tracing_subscriber::EnvFilter;

/// Run mode
enum RunMode {
    /// Server mode (HTTP API + ingestion + scheduler)
    Server,
    /// One-shot job listing
    ListJobs,
    /// One-shot reconciliation pass
    Reconcile,
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = parse_args();

    match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("overseer {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    match mode {
        RunMode::ListJobs => list_jobs(config).await,
        RunMode::Reconcile => reconcile(config).await,
        RunMode::Server => run_server(config).await,
        _ => Ok(()),
    }
}

fn parse_args() -> RunMode {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--list-jobs" | "-l" => return RunMode::ListJobs,
            "--reconcile" | "-r" => return RunMode::Reconcile,
            "--help" | "-h" => return RunMode::Help,
            "--version" | "-v" => return RunMode::Version,
            _ => {}
        }
    }

    RunMode::Server
}

fn print_help() {
    println!("overseer - automation control plane");
    println!();
    println!("Usage:");
    println!("  overseer              Start server mode (HTTP API + maintenance)");
    println!("  overseer --list-jobs  Print every known job as JSON");
    println!("  overseer --reconcile  Reconcile finished jobs and exit");
    println!("  overseer --help       Show this help message");
    println!("  overseer --version    Show version");
    println!();
    println!("Configuration is read from ./overseer.toml when present.");
    println!();
    println!("Environment Variables:");
    println!("  OVERSEER_DB_PATH                 SQLite database path");
    println!("  OVERSEER_JOBS_DIR                Job manifest and log directory");
    println!("  OVERSEER_MAX_JOBS                Concurrent job limit");
    println!("  OVERSEER_WORKER_REPOSITORY_EDIT  Worker for repository edits");
    println!("  OVERSEER_WORKER_CONTENT          Worker for content writing");
    println!("  OVERSEER_WORKER_RESEARCH         Worker for research");
    println!("  API_PORT                         HTTP API port (default: 3000)");
    println!("  API_KEY                          Bearer key for /api endpoints");
    println!("  SCHEDULE_ENABLED                 Run background maintenance (default: true)");
    println!("  SCHEDULE_CONFIG_PATH             Path to schedule.toml");
    println!("  RUST_LOG                         Log filter");
}

/// Listing only needs the supervisor; no store is opened.
async fn list_jobs(config: Config) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(config.supervisor)?;
    let jobs = supervisor.list_all().await?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

async fn reconcile(config: Config) -> anyhow::Result<()> {
    let plane = ControlPlane::from_config(&config)?;
    let reconciled = plane.reconcile_finished().await?;
    tracing::info!("{} job(s) reconciled", reconciled.len());
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting overseer...");
    tracing::info!("Database: {}", config.store.db_path);
    tracing::info!("Jobs directory: {}", config.supervisor.jobs_dir.display());

    let plane = Arc::new(ControlPlane::from_config(&config)?);

    // Catch up on anything that finished while we were down
    match plane.reconcile_finished().await {
        Ok(reconciled) if !reconciled.is_empty() => {
            tracing::info!("Reconciled {} job(s) from a previous run", reconciled.len());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Startup reconciliation failed: {}", e),
    }

    let ingest = plane.spawn_ingest();

    let scheduler = if config.scheduler.enabled {
        let schedule = ScheduleConfig::load(config.scheduler.config_path.as_deref())?;
        let target: Arc<dyn MaintenanceTarget> = plane.clone();
        let scheduler = Scheduler::new(&schedule, target)?;
        tracing::info!("Scheduler enabled with {} task(s)", scheduler.len());
        Some(scheduler.start())
    } else {
        tracing::info!("Scheduler is disabled");
        None
    };

    tracing::info!("overseer initialized successfully");
    tracing::info!("Press Ctrl+C to exit");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        tracing::info!("Shutting down...");
    };
    let served = ov_api::start_server(&config.api, Arc::clone(&plane), shutdown).await;

    if let Some(handle) = scheduler {
        handle.stop().await;
    }
    ingest.abort();

    // Running workers are left alone; the next start adopts them.
    served?;
    tracing::info!("Shutdown complete");
    Ok(())
}
