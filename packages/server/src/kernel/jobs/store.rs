//! Queue storage contract and its PostgreSQL implementation.
//!
//! All durable state for the job subsystem goes through [`JobStore`]:
//! the function catalog, queued job instances, the worker registry and
//! execution log lines. Status transitions are serialised by conditional
//! updates; a predicate miss comes back as [`StoreError::InvalidTransition`]
//! and the store never retries internally; conflicts are the caller's call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use super::function::{FunctionFile, JobFunction};
use super::job::{Job, JobFilter, JobStatus, Progress};
use super::logs::{ExecutionLog, LogLevel};
use super::workers::{WorkerRecord, WorkerStatus};
use crate::common::sql::Record;
use crate::kernel::ServerKernel;

/// Errors surfaced by queue storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// The row exists but the conditional transition predicate did not hold
    /// (or the row vanished between read and write; callers cannot tell the
    /// difference and should not need to).
    #[error("{entity} {id} not found or in incompatible state")]
    InvalidTransition { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Aggregate queue counters for admin surfaces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub interrupted: i64,
    pub workers: i64,
    pub functions: i64,
}

/// Durable state for job definitions, queued instances, workers, progress
/// and execution log lines.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Function catalog -----------------------------------------------------

    async fn create_function(&self, function: JobFunction) -> StoreResult<JobFunction>;

    /// Update by id, bumping `version`.
    async fn update_function(&self, function: JobFunction) -> StoreResult<JobFunction>;

    /// Insert-or-update on `(name, namespace)`, bumping `version` on update.
    async fn upsert_function(&self, function: JobFunction) -> StoreResult<JobFunction>;

    async fn get_function(&self, id: Uuid) -> StoreResult<Option<JobFunction>>;

    async fn get_function_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<JobFunction>>;

    async fn list_functions(&self, namespace: Option<&str>) -> StoreResult<Vec<JobFunction>>;

    async fn delete_function(&self, id: Uuid) -> StoreResult<bool>;

    async fn upsert_function_file(&self, file: FunctionFile) -> StoreResult<FunctionFile>;

    async fn list_function_files(&self, function_id: Uuid) -> StoreResult<Vec<FunctionFile>>;

    // Job instances --------------------------------------------------------

    /// Persist a new pending instance. Lifecycle fields are normalised
    /// regardless of what the caller put in the struct.
    async fn enqueue_job(&self, job: Job) -> StoreResult<Job>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>>;

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    /// Atomically claim the best pending job for `worker_id`, or report that
    /// the queue is empty. See [`Job::claim_next`] for the ordering and
    /// locking contract.
    async fn claim_next_job(&self, worker_id: Uuid) -> StoreResult<Option<Job>>;

    /// running -> completed. `worker_id`, when given, must still own the row.
    async fn complete_job(
        &self,
        id: Uuid,
        worker_id: Option<Uuid>,
        result: serde_json::Value,
    ) -> StoreResult<Job>;

    /// running -> failed.
    async fn fail_job(&self, id: Uuid, worker_id: Option<Uuid>, error: &str) -> StoreResult<Job>;

    /// pending|running -> cancelled, flagging `cancel_requested` for the
    /// owning worker's poll.
    async fn cancel_job(&self, id: Uuid) -> StoreResult<Job>;

    /// failed -> pending, incrementing `retry_count`; refused once the retry
    /// budget is exhausted.
    async fn requeue_job(&self, id: Uuid) -> StoreResult<Job>;

    /// Admin restart from any terminal-but-not-completed state; does not
    /// consume the retry budget.
    async fn restart_job(&self, id: Uuid) -> StoreResult<Job>;

    /// running -> interrupted (worker shutdown, not user failure).
    async fn interrupt_job(&self, id: Uuid, worker_id: Uuid, error: &str) -> StoreResult<Job>;

    async fn update_progress(&self, id: Uuid, progress: Progress) -> StoreResult<()>;

    async fn append_log_line(
        &self,
        job_id: Uuid,
        line_number: i32,
        level: LogLevel,
        message: &str,
    ) -> StoreResult<()>;

    async fn list_logs(&self, job_id: Uuid, after_line: Option<i32>)
        -> StoreResult<Vec<ExecutionLog>>;

    /// Return `(running, worker_id IS NULL)` rows to `pending`.
    async fn reset_orphaned_jobs(&self) -> StoreResult<u64>;

    // Worker registry ------------------------------------------------------

    async fn register_worker(&self, worker: WorkerRecord) -> StoreResult<WorkerRecord>;

    async fn worker_heartbeat(&self, id: Uuid, current_job_count: i32) -> StoreResult<()>;

    async fn set_worker_status(&self, id: Uuid, status: WorkerStatus) -> StoreResult<()>;

    async fn deregister_worker(&self, id: Uuid) -> StoreResult<()>;

    /// Delete workers with no heartbeat inside `timeout`.
    async fn cleanup_stale_workers(&self, timeout: Duration) -> StoreResult<u64>;

    async fn list_workers(&self) -> StoreResult<Vec<WorkerRecord>>;

    async fn queue_stats(&self) -> StoreResult<QueueStats>;
}

/// PostgreSQL-backed store.
pub struct PostgresJobStore {
    kernel: Arc<ServerKernel>,
}

impl PostgresJobStore {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    fn pool(&self) -> &sqlx::PgPool {
        &self.kernel.db_pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_function(&self, function: JobFunction) -> StoreResult<JobFunction> {
        Ok(function.insert(self.pool()).await?)
    }

    async fn update_function(&self, function: JobFunction) -> StoreResult<JobFunction> {
        Ok(function.update(self.pool()).await?)
    }

    async fn upsert_function(&self, function: JobFunction) -> StoreResult<JobFunction> {
        Ok(function.upsert(self.pool()).await?)
    }

    async fn get_function(&self, id: Uuid) -> StoreResult<Option<JobFunction>> {
        match JobFunction::find_by_id(id, self.pool()).await {
            Ok(function) => Ok(Some(function)),
            Err(e) => match e.downcast_ref::<sqlx::Error>() {
                Some(sqlx::Error::RowNotFound) => Ok(None),
                _ => Err(e.into()),
            },
        }
    }

    async fn get_function_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<JobFunction>> {
        Ok(JobFunction::find_by_name(namespace, name, self.pool()).await?)
    }

    async fn list_functions(&self, namespace: Option<&str>) -> StoreResult<Vec<JobFunction>> {
        Ok(JobFunction::list(namespace, self.pool()).await?)
    }

    async fn delete_function(&self, id: Uuid) -> StoreResult<bool> {
        Ok(JobFunction::delete_by_id(id, self.pool()).await?)
    }

    async fn upsert_function_file(&self, file: FunctionFile) -> StoreResult<FunctionFile> {
        Ok(file.upsert(self.pool()).await?)
    }

    async fn list_function_files(&self, function_id: Uuid) -> StoreResult<Vec<FunctionFile>> {
        Ok(FunctionFile::list_for_function(function_id, self.pool()).await?)
    }

    async fn enqueue_job(&self, mut job: Job) -> StoreResult<Job> {
        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.last_progress_at = None;
        job.completed_at = None;
        job.cancel_requested = false;

        Ok(job.insert(self.pool()).await?)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(Job::find_optional(id, self.pool()).await?)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        Ok(Job::list(filter, self.pool()).await?)
    }

    async fn claim_next_job(&self, worker_id: Uuid) -> StoreResult<Option<Job>> {
        Ok(Job::claim_next(worker_id, self.pool()).await?)
    }

    async fn complete_job(
        &self,
        id: Uuid,
        worker_id: Option<Uuid>,
        result: serde_json::Value,
    ) -> StoreResult<Job> {
        Job::complete(id, worker_id, result, self.pool())
            .await?
            .ok_or(StoreError::InvalidTransition { entity: "job", id })
    }

    async fn fail_job(&self, id: Uuid, worker_id: Option<Uuid>, error: &str) -> StoreResult<Job> {
        Job::fail(id, worker_id, error, self.pool())
            .await?
            .ok_or(StoreError::InvalidTransition { entity: "job", id })
    }

    async fn cancel_job(&self, id: Uuid) -> StoreResult<Job> {
        Job::cancel(id, self.pool())
            .await?
            .ok_or(StoreError::InvalidTransition { entity: "job", id })
    }

    async fn requeue_job(&self, id: Uuid) -> StoreResult<Job> {
        Job::requeue(id, self.pool())
            .await?
            .ok_or(StoreError::InvalidTransition { entity: "job", id })
    }

    async fn restart_job(&self, id: Uuid) -> StoreResult<Job> {
        Job::restart(id, self.pool())
            .await?
            .ok_or(StoreError::InvalidTransition { entity: "job", id })
    }

    async fn interrupt_job(&self, id: Uuid, worker_id: Uuid, error: &str) -> StoreResult<Job> {
        Job::interrupt(id, worker_id, error, self.pool())
            .await?
            .ok_or(StoreError::InvalidTransition { entity: "job", id })
    }

    async fn update_progress(&self, id: Uuid, progress: Progress) -> StoreResult<()> {
        Job::update_progress(id, &progress.clamped(), self.pool())
            .await?
            .map(|_| ())
            .ok_or(StoreError::InvalidTransition { entity: "job", id })
    }

    async fn append_log_line(
        &self,
        job_id: Uuid,
        line_number: i32,
        level: LogLevel,
        message: &str,
    ) -> StoreResult<()> {
        ExecutionLog::append(job_id, line_number, level, message, self.pool()).await?;
        Ok(())
    }

    async fn list_logs(
        &self,
        job_id: Uuid,
        after_line: Option<i32>,
    ) -> StoreResult<Vec<ExecutionLog>> {
        Ok(ExecutionLog::list_for_job(job_id, after_line, self.pool()).await?)
    }

    async fn reset_orphaned_jobs(&self) -> StoreResult<u64> {
        Ok(Job::reset_orphaned(self.pool()).await?)
    }

    async fn register_worker(&self, worker: WorkerRecord) -> StoreResult<WorkerRecord> {
        Ok(worker.register(self.pool()).await?)
    }

    async fn worker_heartbeat(&self, id: Uuid, current_job_count: i32) -> StoreResult<()> {
        if WorkerRecord::heartbeat(id, current_job_count, self.pool()).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                entity: "worker",
                id,
            })
        }
    }

    async fn set_worker_status(&self, id: Uuid, status: WorkerStatus) -> StoreResult<()> {
        if WorkerRecord::set_status(id, status, self.pool()).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                entity: "worker",
                id,
            })
        }
    }

    async fn deregister_worker(&self, id: Uuid) -> StoreResult<()> {
        WorkerRecord::deregister(id, self.pool()).await?;
        Ok(())
    }

    async fn cleanup_stale_workers(&self, timeout: Duration) -> StoreResult<u64> {
        Ok(WorkerRecord::cleanup_stale(timeout, self.pool()).await?)
    }

    async fn list_workers(&self) -> StoreResult<Vec<WorkerRecord>> {
        Ok(WorkerRecord::list(self.pool()).await?)
    }

    async fn queue_stats(&self) -> StoreResult<QueueStats> {
        let row: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'pending'),
                   COUNT(*) FILTER (WHERE status = 'running'),
                   COUNT(*) FILTER (WHERE status = 'completed'),
                   COUNT(*) FILTER (WHERE status = 'failed'),
                   COUNT(*) FILTER (WHERE status = 'cancelled'),
                   COUNT(*) FILTER (WHERE status = 'interrupted')
            FROM queue
            "#,
        )
        .fetch_one(self.pool())
        .await
        .map_err(anyhow::Error::from)?;

        let workers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workers")
            .fetch_one(self.pool())
            .await
            .map_err(anyhow::Error::from)?;

        let functions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM functions")
            .fetch_one(self.pool())
            .await
            .map_err(anyhow::Error::from)?;

        Ok(QueueStats {
            pending: row.0,
            running: row.1,
            completed: row.2,
            failed: row.3,
            cancelled: row.4,
            interrupted: row.5,
            workers,
            functions,
        })
    }
}
