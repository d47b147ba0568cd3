//! Job instance model: one execution attempt of a function.
//!
//! All status transitions are conditional updates predicated on the current
//! status (and, where it matters, the owning worker), so stale writers lose
//! the race instead of clobbering newer state. Predicate misses surface as
//! `Ok(None)` and are mapped to a typed conflict by the store layer.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Killed by worker shutdown, not by user code failure.
    Interrupted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Interrupted
        )
    }
}

/// Progress snapshot reported by user code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Progress {
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_left: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Progress {
    /// Clamp `percent` into the 0..=100 range before persisting.
    pub fn clamped(mut self) -> Self {
        self.percent = self.percent.clamp(0.0, 100.0);
        self
    }
}

/// Query filters for job listings.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct JobFilter {
    #[builder(setter(strip_option))]
    pub status: Option<JobStatus>,
    #[builder(setter(strip_option))]
    pub job_name: Option<String>,
    #[builder(setter(strip_option))]
    pub namespace: Option<String>,
    #[builder(setter(strip_option))]
    pub worker_id: Option<Uuid>,
    #[builder(setter(strip_option))]
    pub created_by: Option<String>,
    /// Include the large `payload`/`result` columns (omitted by default).
    pub include_result: bool,
    #[builder(default = 50)]
    pub limit: i64,
    pub offset: i64,
}

/// One concrete execution record of a function.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    #[builder(default = "default".to_string())]
    pub namespace: String,
    #[builder(default, setter(strip_option))]
    pub function_id: Option<Uuid>,
    pub job_name: String,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default, setter(strip_option))]
    pub payload: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub progress: Option<serde_json::Value>,

    #[builder(default = 0)]
    pub priority: i32,

    // Resource limits copied from the function at enqueue time
    #[builder(default = 300)]
    pub max_duration_seconds: i32,
    #[builder(default = 60)]
    pub progress_timeout_seconds: i32,
    #[builder(default = 0)]
    pub max_retries: i32,
    #[builder(default = 0)]
    pub retry_count: i32,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    /// Set when a cancel arrives for a running job; polled by the owning
    /// worker so cancellation also reaches workers on other nodes.
    #[builder(default = false)]
    pub cancel_requested: bool,

    #[builder(default, setter(strip_option))]
    pub worker_id: Option<Uuid>,

    // Submitter identity (already authenticated upstream)
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub user_role: Option<String>,
    #[builder(default, setter(strip_option))]
    pub user_email: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the automatic retry budget still has room.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Deserialize the persisted progress snapshot, if any.
    pub fn progress_snapshot(&self) -> Option<Progress> {
        self.progress
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Claim the single best pending job for `worker_id`.
    ///
    /// Highest priority first, oldest first within a priority, gated on
    /// `scheduled_at`. `FOR UPDATE SKIP LOCKED` lets concurrent workers each
    /// take distinct rows, and the `EXISTS` check refuses the claim when the
    /// worker row has been swept away (a de-registered worker must not
    /// resurrect itself).
    pub async fn claim_next(worker_id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            WITH next_job AS (
                SELECT id
                FROM queue
                WHERE status = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= NOW())
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue q
            SET status = 'running',
                worker_id = $1,
                started_at = NOW(),
                last_progress_at = NOW()
            FROM next_job
            WHERE q.id = next_job.id
              AND EXISTS (SELECT 1 FROM workers w WHERE w.id = $1)
            RETURNING q.id, q.namespace, q.function_id, q.job_name, q.status, q.payload, q.result,
                      q.progress, q.priority, q.max_duration_seconds, q.progress_timeout_seconds,
                      q.max_retries, q.retry_count, q.error_message, q.cancel_requested, q.worker_id,
                      q.created_by, q.user_role, q.user_email, q.created_at, q.scheduled_at,
                      q.started_at, q.last_progress_at, q.completed_at
            "#,
        )
        .bind(worker_id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// running -> completed. `None` when the row is gone, not running, or
    /// owned by a different worker (stale completion after orphan re-claim).
    pub async fn complete(
        id: Uuid,
        worker_id: Option<Uuid>,
        result: serde_json::Value,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE queue
            SET status = 'completed',
                result = $3,
                completed_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND ($2::uuid IS NULL OR worker_id = $2)
            RETURNING id, namespace, function_id, job_name, status, payload, result, progress,
                      priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                      retry_count, error_message, cancel_requested, worker_id, created_by,
                      user_role, user_email, created_at, scheduled_at, started_at,
                      last_progress_at, completed_at
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(result)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// running -> failed, with the same ownership predicate as `complete`.
    pub async fn fail(
        id: Uuid,
        worker_id: Option<Uuid>,
        error: &str,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE queue
            SET status = 'failed',
                error_message = $3,
                completed_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND ($2::uuid IS NULL OR worker_id = $2)
            RETURNING id, namespace, function_id, job_name, status, payload, result, progress,
                      priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                      retry_count, error_message, cancel_requested, worker_id, created_by,
                      user_role, user_email, created_at, scheduled_at, started_at,
                      last_progress_at, completed_at
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// pending|running -> cancelled. For a running row the `cancel_requested`
    /// flag is what the owning worker's watchdog polls; `completed_at` is only
    /// stamped when the job actually left `running`.
    pub async fn cancel(id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE queue
            SET status = 'cancelled',
                cancel_requested = TRUE,
                completed_at = CASE WHEN status = 'running' THEN NOW() ELSE completed_at END
            WHERE id = $1
              AND status IN ('pending', 'running')
            RETURNING id, namespace, function_id, job_name, status, payload, result, progress,
                      priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                      retry_count, error_message, cancel_requested, worker_id, created_by,
                      user_role, user_email, created_at, scheduled_at, started_at,
                      last_progress_at, completed_at
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// failed -> pending, consuming one unit of the retry budget.
    pub async fn requeue(id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE queue
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                last_progress_at = NULL,
                completed_at = NULL,
                error_message = NULL,
                cancel_requested = FALSE,
                retry_count = retry_count + 1
            WHERE id = $1
              AND status = 'failed'
              AND retry_count < max_retries
            RETURNING id, namespace, function_id, job_name, status, payload, result, progress,
                      priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                      retry_count, error_message, cancel_requested, worker_id, created_by,
                      user_role, user_email, created_at, scheduled_at, started_at,
                      last_progress_at, completed_at
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// failed|cancelled|interrupted -> pending. Admin restart: does not touch
    /// the automatic retry budget.
    pub async fn restart(id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE queue
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                last_progress_at = NULL,
                completed_at = NULL,
                error_message = NULL,
                cancel_requested = FALSE
            WHERE id = $1
              AND status IN ('failed', 'cancelled', 'interrupted')
            RETURNING id, namespace, function_id, job_name, status, payload, result, progress,
                      priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                      retry_count, error_message, cancel_requested, worker_id, created_by,
                      user_role, user_email, created_at, scheduled_at, started_at,
                      last_progress_at, completed_at
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// running -> interrupted. Used by graceful drain when in-flight jobs must
    /// be killed; distinct from `failed` so callers can tell "worker shutdown"
    /// from "user code failure".
    pub async fn interrupt(
        id: Uuid,
        worker_id: Uuid,
        error: &str,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE queue
            SET status = 'interrupted',
                error_message = $3,
                completed_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND worker_id = $2
            RETURNING id, namespace, function_id, job_name, status, payload, result, progress,
                      priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                      retry_count, error_message, cancel_requested, worker_id, created_by,
                      user_role, user_email, created_at, scheduled_at, started_at,
                      last_progress_at, completed_at
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(error)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Persist a progress snapshot. `last_progress_at` is monotone: a late
    /// write can never move it backwards.
    pub async fn update_progress(
        id: Uuid,
        progress: &Progress,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE queue
            SET progress = $2,
                last_progress_at = GREATEST(last_progress_at, NOW())
            WHERE id = $1
              AND status = 'running'
            RETURNING id, namespace, function_id, job_name, status, payload, result, progress,
                      priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                      retry_count, error_message, cancel_requested, worker_id, created_by,
                      user_role, user_email, created_at, scheduled_at, started_at,
                      last_progress_at, completed_at
            "#,
        )
        .bind(id)
        .bind(serde_json::to_value(progress)?)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    /// Return every `(running, worker_id IS NULL)` row to `pending`. The
    /// worker_id goes NULL when the stale-worker sweep deletes the owner, so
    /// these are exactly the orphans.
    pub async fn reset_orphaned(db: &sqlx::PgPool) -> Result<u64> {
        let reset = sqlx::query(
            r#"
            UPDATE queue
            SET status = 'pending',
                started_at = NULL,
                last_progress_at = NULL
            WHERE status = 'running'
              AND worker_id IS NULL
            "#,
        )
        .execute(db)
        .await?
        .rows_affected();

        Ok(reset)
    }

    /// Filtered listing, newest first. `payload`/`result` are omitted unless
    /// the filter opts in; they can be large and most listings don't need them.
    pub async fn list(filter: &JobFilter, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let columns = if filter.include_result {
            "id, namespace, function_id, job_name, status, payload, result, progress, \
             priority, max_duration_seconds, progress_timeout_seconds, max_retries, \
             retry_count, error_message, cancel_requested, worker_id, created_by, \
             user_role, user_email, created_at, scheduled_at, started_at, \
             last_progress_at, completed_at"
        } else {
            "id, namespace, function_id, job_name, status, NULL::jsonb AS payload, \
             NULL::jsonb AS result, progress, priority, max_duration_seconds, \
             progress_timeout_seconds, max_retries, retry_count, error_message, \
             cancel_requested, worker_id, created_by, user_role, user_email, created_at, \
             scheduled_at, started_at, last_progress_at, completed_at"
        };

        let query = format!(
            r#"
            SELECT {columns}
            FROM queue
            WHERE ($1::job_status IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_name = $2)
              AND ($3::text IS NULL OR namespace = $3)
              AND ($4::uuid IS NULL OR worker_id = $4)
              AND ($5::text IS NULL OR created_by = $5)
            ORDER BY created_at DESC
            LIMIT $6 OFFSET $7
            "#
        );

        let jobs = sqlx::query_as::<_, Self>(&query)
            .bind(filter.status)
            .bind(&filter.job_name)
            .bind(&filter.namespace)
            .bind(filter.worker_id)
            .bind(&filter.created_by)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(db)
            .await?;

        Ok(jobs)
    }

    pub async fn find_optional(id: Uuid, db: &sqlx::PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, namespace, function_id, job_name, status, payload, result, progress,
                   priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                   retry_count, error_message, cancel_requested, worker_id, created_by,
                   user_role, user_email, created_at, scheduled_at, started_at,
                   last_progress_at, completed_at
            FROM queue
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }
}

impl Job {
    pub(crate) async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO queue (
                id, namespace, function_id, job_name, status, payload, result, progress,
                priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                retry_count, error_message, cancel_requested, worker_id, created_by,
                user_role, user_email, created_at, scheduled_at, started_at,
                last_progress_at, completed_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8,
                $9, $10, $11, $12,
                $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22,
                $23, $24
            )
            RETURNING id, namespace, function_id, job_name, status, payload, result, progress,
                      priority, max_duration_seconds, progress_timeout_seconds, max_retries,
                      retry_count, error_message, cancel_requested, worker_id, created_by,
                      user_role, user_email, created_at, scheduled_at, started_at,
                      last_progress_at, completed_at
            "#,
        )
        .bind(self.id)
        .bind(&self.namespace)
        .bind(self.function_id)
        .bind(&self.job_name)
        .bind(self.status)
        .bind(&self.payload)
        .bind(&self.result)
        .bind(&self.progress)
        .bind(self.priority)
        .bind(self.max_duration_seconds)
        .bind(self.progress_timeout_seconds)
        .bind(self.max_retries)
        .bind(self.retry_count)
        .bind(&self.error_message)
        .bind(self.cancel_requested)
        .bind(self.worker_id)
        .bind(&self.created_by)
        .bind(&self.user_role)
        .bind(&self.user_email)
        .bind(self.created_at)
        .bind(self.scheduled_at)
        .bind(self.started_at)
        .bind(self.last_progress_at)
        .bind(self.completed_at)
        .fetch_one(db)
        .await?;

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder().job_name("sum").build()
    }

    #[test]
    fn new_job_starts_pending_with_no_worker() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());
        assert!(job.started_at.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Interrupted.is_terminal());
    }

    #[test]
    fn can_retry_respects_budget() {
        let mut job = sample_job();
        assert!(!job.can_retry());

        job.max_retries = 2;
        assert!(job.can_retry());

        job.retry_count = 2;
        assert!(!job.can_retry());
    }

    #[test]
    fn progress_percent_is_clamped() {
        let p = Progress {
            percent: 140.0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(p.percent, 100.0);

        let p = Progress {
            percent: -3.0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(p.percent, 0.0);
    }

    #[test]
    fn progress_snapshot_round_trips_through_json() {
        let mut job = sample_job();
        let progress = Progress {
            percent: 25.0,
            message: Some("stage A".to_string()),
            estimated_seconds_left: None,
            data: None,
        };
        job.progress = Some(serde_json::to_value(&progress).unwrap());

        assert_eq!(job.progress_snapshot(), Some(progress));
    }
}
