//! Test harness with testcontainers for integration testing.
//!
//! One shared Postgres container is started on first use; each test gets its
//! own freshly migrated database inside it.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use fluxbase_core::config::Config;
use fluxbase_core::kernel::jobs::{Job, JobFunction, JobStore, PostgresJobStore, WorkerRecord};
use fluxbase_core::kernel::ServerKernel;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedTestInfra {
    base_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

        Ok(Self {
            base_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// A fresh, migrated database on the shared container.
pub async fn test_pool() -> PgPool {
    let infra = SharedTestInfra::get().await;

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    let admin = PgPool::connect(&format!("{}/postgres", infra.base_url))
        .await
        .expect("Failed to connect to admin database");
    sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
        .execute(&admin)
        .await
        .expect("Failed to create test database");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&format!("{}/{db_name}", infra.base_url))
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Postgres-backed store over a fresh database.
pub async fn postgres_store() -> (Arc<dyn JobStore>, PgPool) {
    let pool = test_pool().await;
    let kernel = Arc::new(ServerKernel::without_secrets(pool.clone(), Config::default()));
    (Arc::new(PostgresJobStore::new(kernel)), pool)
}

pub fn sample_function(name: &str) -> JobFunction {
    JobFunction::builder()
        .name(name.to_string())
        .code("export function handler() { return { ok: true }; }".to_string())
        .build()
}

pub fn sample_job(name: &str) -> Job {
    Job::builder().job_name(name.to_string()).build()
}

pub async fn registered_worker(store: &Arc<dyn JobStore>) -> WorkerRecord {
    store
        .register_worker(WorkerRecord::new("test-worker", "test-host", 5))
        .await
        .expect("Failed to register worker")
}
