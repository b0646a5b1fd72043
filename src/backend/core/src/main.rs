//! Apex Scheduler - Main entry point
//!
//! Runs a scheduler instance against PostgreSQL and Redis. Application job types
//! are registered by embedding the library; this binary runs the maintenance jobs
//! and takes part in the cluster.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use apex_scheduler::{
    config::AppConfig,
    jobs::{PgJobStore, RedisMutexManager, RedisPubSub, Scheduler},
    telemetry,
};

/// How long running jobs get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "apex-scheduler", version, about = "Apex background job scheduler")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "APEX_CONFIG")]
    config: Option<String>,

    /// Override the instance identifier
    #[arg(long, env = "APEX_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Skip applying database migrations on startup
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::load()?,
    };
    if let Some(instance_id) = args.instance_id {
        config.scheduler.instance_id = instance_id;
    }

    telemetry::init_logging(&config.logging)?;
    if let Some(addr) = &config.metrics.listen_addr {
        telemetry::init_metrics(addr)?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        instance_id = %config.scheduler.instance_id,
        max_running = config.scheduler.max_running,
        "Starting Apex Scheduler"
    );

    // Connect to database
    let store = PgJobStore::connect(&config.database).await?;
    if !args.skip_migrations {
        store.migrate().await?;
        tracing::info!("Database migrations applied");
    }

    // Create Redis client
    let redis_client = redis::Client::open(config.redis.url.as_str())
        .map_err(|e| anyhow::anyhow!("Failed to create Redis client: {}", e))?;
    tracing::info!("Redis client created for {}", config.redis.url);

    let mutex_manager = RedisMutexManager::new(
        redis_client.clone(),
        config.scheduler.lock_expiry,
        config.scheduler.lock_acquire_timeout,
    );
    let pubsub = RedisPubSub::new(redis_client);

    let scheduler = Scheduler::new(
        Arc::new(store),
        Arc::new(mutex_manager),
        Arc::new(pubsub),
        config.scheduler.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    scheduler.run(shutdown).await?;

    if !scheduler.wait_jobs_done(SHUTDOWN_GRACE).await {
        tracing::warn!("Exiting with jobs still running");
    }

    tracing::info!("Scheduler shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
