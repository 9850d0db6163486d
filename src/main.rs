//! # permsync entry point
//!
//! Loads configuration, wires telemetry, storage and providers, then runs the
//! admin API together with the sync worker and scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use permsync::{
    authz::Providers,
    config::{AppConfig, ConfigLoader},
    db,
    rcache::Rcache,
    scheduler::PermsSyncScheduler,
    server::{AppState, run_server},
    telemetry,
    worker::PermsSyncWorker,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "permsync", version, about = "Repository permissions sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the API, worker and scheduler (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config)?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::migrate(&db).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => Ok(()),
        Command::Serve => serve(config, db).await,
    }
}

async fn serve(config: AppConfig, db: sea_orm::DatabaseConnection) -> Result<()> {
    let rcache = match config.redis_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => Rcache::connect(url, &config.redis_key_prefix)
            .await
            .context("connecting to redis")?,
        None => {
            warn!("No Redis URL configured, using in-process cache");
            Rcache::in_memory(&config.redis_key_prefix)
        }
    };

    let providers = Providers::from_config(&config, &rcache)?;
    if providers.is_empty() {
        warn!("No code hosts configured, permission syncs will not fetch anything");
    }

    let config = Arc::new(config);
    let providers = Arc::new(providers);
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    if config.worker.enabled {
        let worker = PermsSyncWorker::new(db.clone(), Arc::clone(&providers), config.worker.clone());
        tasks.spawn(worker.run(shutdown.child_token()));
    }
    if config.scheduler.enabled {
        let scheduler =
            PermsSyncScheduler::new(config.scheduler.clone(), db.clone(), rcache.clone());
        tasks.spawn(scheduler.run(shutdown.child_token()));
    }

    let state = AppState {
        config,
        db,
        providers,
        rcache,
    };
    let server = tokio::spawn(run_server(state, shutdown.child_token()));

    shutdown_signal().await;
    info!("Shutdown requested");
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "Server exited with error"),
        Err(err) => error!(error = %err, "Server task failed"),
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "Background task failed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
