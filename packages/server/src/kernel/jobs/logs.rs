//! Append-only execution log lines captured from job subprocess output.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "log_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// One captured output line. `line_number` is assigned by the worker that
/// owns the job and is strictly increasing per job, starting at 0.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub job_id: Uuid,
    pub line_number: i32,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    pub async fn append(
        job_id: Uuid,
        line_number: i32,
        level: LogLevel,
        message: &str,
        db: &sqlx::PgPool,
    ) -> Result<Self> {
        let line = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO execution_logs (id, job_id, line_number, level, message, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id, job_id, line_number, level, message, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job_id)
        .bind(line_number)
        .bind(level)
        .bind(message)
        .fetch_one(db)
        .await?;

        Ok(line)
    }

    /// Lines for a job in line order, optionally only those after a cursor
    /// (for incremental log tailing).
    pub async fn list_for_job(
        job_id: Uuid,
        after_line: Option<i32>,
        db: &sqlx::PgPool,
    ) -> Result<Vec<Self>> {
        let lines = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, line_number, level, message, created_at
            FROM execution_logs
            WHERE job_id = $1
              AND ($2::integer IS NULL OR line_number > $2)
            ORDER BY line_number ASC
            "#,
        )
        .bind(job_id)
        .bind(after_line)
        .fetch_all(db)
        .await?;

        Ok(lines)
    }
}
