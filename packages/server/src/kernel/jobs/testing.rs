//! In-memory test doubles for the job subsystem.
//!
//! [`MemoryJobStore`] mirrors every transition predicate of the Postgres
//! store (including the foreign-key null-out that creates orphans) so the
//! worker, manager, scheduler and service can be exercised hermetically.
//! [`ScriptedRuntime`] stands in for the subprocess runtime with canned
//! outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::function::{FunctionFile, JobFunction, Permissions};
use super::job::{Job, JobFilter, JobStatus, Progress};
use super::logs::{ExecutionLog, LogLevel};
use super::runtime::{ExecutionRequest, ExecutionResult, JobRuntime};
use super::store::{JobStore, QueueStats, StoreError, StoreResult};
use super::workers::{WorkerRecord, WorkerStatus};

#[derive(Default)]
struct Inner {
    functions: HashMap<Uuid, JobFunction>,
    files: HashMap<(Uuid, String), FunctionFile>,
    jobs: HashMap<Uuid, Job>,
    logs: Vec<ExecutionLog>,
    workers: HashMap<Uuid, WorkerRecord>,
}

/// In-memory [`JobStore`] with the same observable semantics as Postgres.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_function(&self, function: JobFunction) -> StoreResult<JobFunction> {
        let mut inner = self.lock();
        inner.functions.insert(function.id, function.clone());
        Ok(function)
    }

    async fn update_function(&self, function: JobFunction) -> StoreResult<JobFunction> {
        let mut inner = self.lock();
        let existing =
            inner
                .functions
                .get(&function.id)
                .cloned()
                .ok_or(StoreError::NotFound {
                    entity: "function",
                    id: function.id,
                })?;

        let mut updated = function;
        updated.created_at = existing.created_at;
        updated.version = existing.version + 1;
        updated.updated_at = Utc::now();
        inner.functions.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn upsert_function(&self, function: JobFunction) -> StoreResult<JobFunction> {
        let mut inner = self.lock();
        let existing = inner
            .functions
            .values()
            .find(|f| f.name == function.name && f.namespace == function.namespace)
            .cloned();

        let stored = match existing {
            Some(existing) => {
                let mut updated = function;
                updated.id = existing.id;
                updated.created_at = existing.created_at;
                updated.version = existing.version + 1;
                updated.updated_at = Utc::now();
                updated
            }
            None => function,
        };
        inner.functions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_function(&self, id: Uuid) -> StoreResult<Option<JobFunction>> {
        Ok(self.lock().functions.get(&id).cloned())
    }

    async fn get_function_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<JobFunction>> {
        Ok(self
            .lock()
            .functions
            .values()
            .find(|f| f.namespace == namespace && f.name == name)
            .cloned())
    }

    async fn list_functions(&self, namespace: Option<&str>) -> StoreResult<Vec<JobFunction>> {
        let mut functions: Vec<JobFunction> = self
            .lock()
            .functions
            .values()
            .filter(|f| namespace.map_or(true, |ns| f.namespace == ns))
            .cloned()
            .collect();
        functions.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(functions)
    }

    async fn delete_function(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock();
        let deleted = inner.functions.remove(&id).is_some();
        if deleted {
            inner.files.retain(|(function_id, _), _| *function_id != id);
            // Instances keep their frozen job_name/namespace copies.
            for job in inner.jobs.values_mut() {
                if job.function_id == Some(id) {
                    job.function_id = None;
                }
            }
        }
        Ok(deleted)
    }

    async fn upsert_function_file(&self, file: FunctionFile) -> StoreResult<FunctionFile> {
        let mut inner = self.lock();
        inner
            .files
            .insert((file.function_id, file.file_path.clone()), file.clone());
        Ok(file)
    }

    async fn list_function_files(&self, function_id: Uuid) -> StoreResult<Vec<FunctionFile>> {
        let mut files: Vec<FunctionFile> = self
            .lock()
            .files
            .values()
            .filter(|f| f.function_id == function_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(files)
    }

    async fn enqueue_job(&self, mut job: Job) -> StoreResult<Job> {
        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.last_progress_at = None;
        job.completed_at = None;
        job.cancel_requested = false;

        self.lock().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| filter.job_name.as_deref().map_or(true, |n| j.job_name == n))
            .filter(|j| filter.namespace.as_deref().map_or(true, |n| j.namespace == n))
            .filter(|j| filter.worker_id.map_or(true, |w| j.worker_id == Some(w)))
            .filter(|j| {
                filter
                    .created_by
                    .as_deref()
                    .map_or(true, |c| j.created_by.as_deref() == Some(c))
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let jobs: Vec<Job> = jobs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .map(|mut job| {
                if !filter.include_result {
                    job.payload = None;
                    job.result = None;
                }
                job
            })
            .collect();

        Ok(jobs)
    }

    async fn claim_next_job(&self, worker_id: Uuid) -> StoreResult<Option<Job>> {
        let mut inner = self.lock();
        if !inner.workers.contains_key(&worker_id) {
            return Ok(None);
        }

        let now = Utc::now();
        let best = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| j.scheduled_at.map_or(true, |at| at <= now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id);

        let Some(id) = best else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).expect("claimed job exists");
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id);
        job.started_at = Some(now);
        job.last_progress_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        id: Uuid,
        worker_id: Option<Uuid>,
        result: Value,
    ) -> StoreResult<Job> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| worker_id.map_or(true, |w| j.worker_id == Some(w)))
            .ok_or(StoreError::InvalidTransition { entity: "job", id })?;

        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn fail_job(&self, id: Uuid, worker_id: Option<Uuid>, error: &str) -> StoreResult<Job> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| worker_id.map_or(true, |w| j.worker_id == Some(w)))
            .ok_or(StoreError::InvalidTransition { entity: "job", id })?;

        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn cancel_job(&self, id: Uuid) -> StoreResult<Job> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
            .ok_or(StoreError::InvalidTransition { entity: "job", id })?;

        if job.status == JobStatus::Running {
            job.completed_at = Some(Utc::now());
        }
        job.status = JobStatus::Cancelled;
        job.cancel_requested = true;
        Ok(job.clone())
    }

    async fn requeue_job(&self, id: Uuid) -> StoreResult<Job> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| j.status == JobStatus::Failed)
            .filter(|j| j.retry_count < j.max_retries)
            .ok_or(StoreError::InvalidTransition { entity: "job", id })?;

        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.last_progress_at = None;
        job.completed_at = None;
        job.error_message = None;
        job.cancel_requested = false;
        job.retry_count += 1;
        Ok(job.clone())
    }

    async fn restart_job(&self, id: Uuid) -> StoreResult<Job> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| {
                matches!(
                    j.status,
                    JobStatus::Failed | JobStatus::Cancelled | JobStatus::Interrupted
                )
            })
            .ok_or(StoreError::InvalidTransition { entity: "job", id })?;

        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.last_progress_at = None;
        job.completed_at = None;
        job.error_message = None;
        job.cancel_requested = false;
        Ok(job.clone())
    }

    async fn interrupt_job(&self, id: Uuid, worker_id: Uuid, error: &str) -> StoreResult<Job> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| j.worker_id == Some(worker_id))
            .ok_or(StoreError::InvalidTransition { entity: "job", id })?;

        job.status = JobStatus::Interrupted;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn update_progress(&self, id: Uuid, progress: Progress) -> StoreResult<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| j.status == JobStatus::Running)
            .ok_or(StoreError::InvalidTransition { entity: "job", id })?;

        job.progress = Some(serde_json::to_value(progress.clamped()).map_err(anyhow::Error::from)?);
        let now = Utc::now();
        job.last_progress_at = Some(job.last_progress_at.map_or(now, |prev| prev.max(now)));
        Ok(())
    }

    async fn append_log_line(
        &self,
        job_id: Uuid,
        line_number: i32,
        level: LogLevel,
        message: &str,
    ) -> StoreResult<()> {
        self.lock().logs.push(ExecutionLog {
            id: Uuid::now_v7(),
            job_id,
            line_number,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_logs(
        &self,
        job_id: Uuid,
        after_line: Option<i32>,
    ) -> StoreResult<Vec<ExecutionLog>> {
        let mut lines: Vec<ExecutionLog> = self
            .lock()
            .logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .filter(|l| after_line.map_or(true, |after| l.line_number > after))
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.line_number);
        Ok(lines)
    }

    async fn reset_orphaned_jobs(&self) -> StoreResult<u64> {
        let mut inner = self.lock();
        let mut reset = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running && job.worker_id.is_none() {
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.last_progress_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn register_worker(&self, worker: WorkerRecord) -> StoreResult<WorkerRecord> {
        self.lock().workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn worker_heartbeat(&self, id: Uuid, current_job_count: i32) -> StoreResult<()> {
        let mut inner = self.lock();
        let worker = inner.workers.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "worker",
            id,
        })?;
        worker.last_heartbeat_at = Utc::now();
        worker.current_job_count = current_job_count;
        Ok(())
    }

    async fn set_worker_status(&self, id: Uuid, status: WorkerStatus) -> StoreResult<()> {
        let mut inner = self.lock();
        let worker = inner.workers.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "worker",
            id,
        })?;
        worker.status = status;
        Ok(())
    }

    async fn deregister_worker(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.workers.remove(&id).is_some() {
            // FK ON DELETE SET NULL.
            for job in inner.jobs.values_mut() {
                if job.worker_id == Some(id) {
                    job.worker_id = None;
                }
            }
        }
        Ok(())
    }

    async fn cleanup_stale_workers(&self, timeout: Duration) -> StoreResult<u64> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(60));

        let mut inner = self.lock();
        let stale: Vec<Uuid> = inner
            .workers
            .values()
            .filter(|w| w.last_heartbeat_at < cutoff)
            .map(|w| w.id)
            .collect();

        for id in &stale {
            inner.workers.remove(id);
            for job in inner.jobs.values_mut() {
                if job.worker_id == Some(*id) {
                    job.worker_id = None;
                }
            }
        }

        Ok(stale.len() as u64)
    }

    async fn list_workers(&self) -> StoreResult<Vec<WorkerRecord>> {
        let mut workers: Vec<WorkerRecord> = self.lock().workers.values().cloned().collect();
        workers.sort_by_key(|w| w.started_at);
        Ok(workers)
    }

    async fn queue_stats(&self) -> StoreResult<QueueStats> {
        let inner = self.lock();
        let mut stats = QueueStats {
            workers: inner.workers.len() as i64,
            functions: inner.functions.len() as i64,
            ..Default::default()
        };
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Interrupted => stats.interrupted += 1,
            }
        }
        Ok(stats)
    }
}

/// Canned outcome for one [`ScriptedRuntime`] execution.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed(Value),
    Fail(String),
    /// Block until the job's cancellation token fires.
    HangUntilCancelled,
    /// Sleep, then succeed (unless cancelled first).
    SleepThenSucceed(Duration, Value),
}

/// [`JobRuntime`] double that replays a script of outcomes in order. Once the
/// script is exhausted every execution succeeds with `null`.
#[derive(Default)]
pub struct ScriptedRuntime {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    executions: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRuntime for ScriptedRuntime {
    async fn execute(
        &self,
        _code: &str,
        _request: ExecutionRequest,
        _permissions: &Permissions,
        cancel: CancellationToken,
        _timeout_override: Option<Duration>,
        _secrets: HashMap<String, String>,
    ) -> Result<ExecutionResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(ScriptedOutcome::Succeed(Value::Null));

        let cancelled = ExecutionResult {
            success: false,
            result: None,
            error: Some("cancelled".to_string()),
            cancelled: true,
            timed_out: false,
            duration: Duration::ZERO,
        };

        match outcome {
            ScriptedOutcome::Succeed(result) => Ok(ExecutionResult {
                success: true,
                result: Some(result),
                ..Default::default()
            }),
            ScriptedOutcome::Fail(error) => Ok(ExecutionResult {
                success: false,
                error: Some(error),
                ..Default::default()
            }),
            ScriptedOutcome::HangUntilCancelled => {
                cancel.cancelled().await;
                Ok(cancelled)
            }
            ScriptedOutcome::SleepThenSucceed(delay, result) => {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(cancelled),
                    _ = tokio::time::sleep(delay) => Ok(ExecutionResult {
                        success: true,
                        result: Some(result),
                        ..Default::default()
                    }),
                }
            }
        }
    }
}
