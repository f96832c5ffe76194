//! EDA server binary - composition root.
//!
//! Ties the EDA crates into a single executable:
//! 1. Load configuration from TOML and apply CLI/env overrides
//! 2. Open the SQLite database
//! 3. Build the job queue, orchestrator, liveness monitor and worker pool
//! 4. Start the monitor ticker and the worker loop
//! 5. Serve the axum REST API until Ctrl-C

mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use eda_activation::{
    ActivationLocks, ActivationStore, EngineLauncher, JobDispatcher, JobWorker, LivenessMonitor,
    Orchestrator, ProcessLauncher, QueueDispatcher, SqliteStore,
};
use eda_api::AppState;
use eda_core::config::EdaConfig;
use eda_storage::Database;

use crate::cli::{expand_home, CliArgs};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let config_exists = config_file.exists();
    let mut config = if config_exists {
        EdaConfig::load(&config_file)?
    } else {
        EdaConfig::default()
    };
    config.server.port = args.resolve_port(config.server.port);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    if let Some(level) = args.resolve_log_level() {
        config.general.log_level = level;
    }

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting EDA server v{}", env!("CARGO_PKG_VERSION"));
    if config_exists {
        tracing::info!(path = %config_file.display(), "Configuration loaded");
    } else {
        tracing::info!(path = %config_file.display(), "No configuration file, using defaults");
    }

    // Storage.
    let data_dir = expand_home(&config.general.data_dir);
    let db_path = data_dir.join("eda.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");
    let store: Arc<dyn ActivationStore> = Arc::new(SqliteStore::new(db));

    // Lifecycle.
    let (dispatcher, queue) = QueueDispatcher::new();
    let dispatcher: Arc<dyn JobDispatcher> = Arc::new(dispatcher);
    let locks = Arc::new(ActivationLocks::new());
    let monitor = Arc::new(LivenessMonitor::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        Arc::clone(&locks),
        &config,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        Arc::clone(&locks),
        Arc::clone(&monitor),
        &config,
    ));
    let launcher: Arc<dyn EngineLauncher> = Arc::new(ProcessLauncher::new(&config.worker));
    let worker = Arc::new(JobWorker::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        Arc::clone(&monitor),
        launcher,
        &config.worker,
    ));

    // === Background tasks ===

    let monitor_task = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.run().await })
    };
    let worker_task = tokio::spawn(Arc::clone(&worker).run(queue));

    // === API server ===

    let state = AppState::new(orchestrator, config.server.clone());
    let served = eda_api::start_server(&config.server, state, shutdown_signal()).await;

    monitor.shutdown();
    worker.shutdown();
    if let Err(e) = monitor_task.await {
        tracing::warn!(error = %e, "Liveness monitor task ended abnormally");
    }
    if let Err(e) = worker_task.await {
        tracing::warn!(error = %e, "Job worker task ended abnormally");
    }

    if let Err(e) = served {
        tracing::error!(error = %e, "API server failed");
        return Err(e.into());
    }
    tracing::info!("EDA server stopped");
    Ok(())
}
