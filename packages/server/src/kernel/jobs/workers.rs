//! Worker registry: one row per live worker, kept fresh by heartbeats.
//!
//! Rows are deleted on graceful exit or by the stale-worker sweep; the
//! `queue.worker_id` foreign key nulls out on delete, which is what flags
//! running jobs as orphans.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "worker_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Active,
    Draining,
    Stopped,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub status: WorkerStatus,
    pub max_concurrent_jobs: i32,
    pub current_job_count: i32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl WorkerRecord {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, max_concurrent_jobs: i32) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            hostname: hostname.into(),
            status: WorkerStatus::Active,
            max_concurrent_jobs,
            current_job_count: 0,
            last_heartbeat_at: Utc::now(),
            started_at: Utc::now(),
            metadata: serde_json::json!({}),
        }
    }

    pub async fn register(&self, db: &sqlx::PgPool) -> Result<Self> {
        let worker = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO workers (
                id, name, hostname, status, max_concurrent_jobs, current_job_count,
                last_heartbeat_at, started_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW(), $7)
            RETURNING id, name, hostname, status, max_concurrent_jobs, current_job_count,
                      last_heartbeat_at, started_at, metadata
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.hostname)
        .bind(self.status)
        .bind(self.max_concurrent_jobs)
        .bind(self.current_job_count)
        .bind(&self.metadata)
        .fetch_one(db)
        .await?;

        Ok(worker)
    }

    pub async fn heartbeat(id: Uuid, current_job_count: i32, db: &sqlx::PgPool) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat_at = NOW(),
                current_job_count = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(current_job_count)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    pub async fn set_status(id: Uuid, status: WorkerStatus, db: &sqlx::PgPool) -> Result<bool> {
        let updated = sqlx::query("UPDATE workers SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(db)
            .await?
            .rows_affected();

        Ok(updated > 0)
    }

    pub async fn deregister(id: Uuid, db: &sqlx::PgPool) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }

    /// Delete workers whose heartbeat is older than `timeout`. Their running
    /// jobs become orphans via the FK and are picked up by the orphan reset.
    pub async fn cleanup_stale(timeout: Duration, db: &sqlx::PgPool) -> Result<u64> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(60));

        let deleted = sqlx::query("DELETE FROM workers WHERE last_heartbeat_at < $1")
            .bind(cutoff)
            .execute(db)
            .await?
            .rows_affected();

        Ok(deleted)
    }

    pub async fn list(db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let workers = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, hostname, status, max_concurrent_jobs, current_job_count,
                   last_heartbeat_at, started_at, metadata
            FROM workers
            ORDER BY started_at ASC
            "#,
        )
        .fetch_all(db)
        .await?;

        Ok(workers)
    }
}
