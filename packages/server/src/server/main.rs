//! Job server binary: runs the worker pool and the cron scheduler against
//! the configured database, draining gracefully on ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use fluxbase_core::config::Config;
use fluxbase_core::kernel::jobs::{FunctionScheduler, JobStore, PostgresJobStore, WorkerManager};
use fluxbase_core::kernel::ServerKernel;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fluxbase_core=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = Config::from_env()?;

    tracing::info!("Starting job server");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let worker_count = config.worker_count;
    let kernel = Arc::new(ServerKernel::without_secrets(pool, config));
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(Arc::clone(&kernel)));

    let scheduler = Arc::new(FunctionScheduler::new(Arc::clone(&store)).await?);
    scheduler.start().await?;

    let manager = Arc::new(WorkerManager::new());
    manager.start(&kernel, &store, worker_count);

    tracing::info!(worker_count, "job server running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("received shutdown signal");

    manager.stop().await;
    scheduler.shutdown().await?;

    tracing::info!("job server stopped");
    Ok(())
}
