//! Job worker: a long-running agent that claims jobs and runs them.
//!
//! Each worker owns four periodic loops plus up to `max_concurrent_jobs`
//! in-flight execute tasks:
//!
//! ```text
//! Worker
//!     ├─► poll loop      claim pending jobs, dispatch execute tasks
//!     ├─► heartbeat loop keep the registry row fresh
//!     ├─► watchdog loop  progress timeouts + database cancel polling
//!     └─► sweep loop     delete stale workers, reset orphaned jobs
//! ```
//!
//! The worker exclusively owns the in-memory cancellation token and log line
//! counter of every job it has claimed, for the duration of the claim.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{Job, JobStatus, Progress};
use super::logs::LogLevel;
use super::runtime::{ExecutionObserver, ExecutionRequest, JobRuntime};
use super::store::{JobStore, StoreError};
use super::workers::{WorkerRecord, WorkerStatus};
use crate::config::Config;
use crate::kernel::traits::SecretStore;

/// Configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub watchdog_interval: Duration,
    pub worker_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: format!("worker-{}", Uuid::new_v4()),
            max_concurrent_jobs: 5,
            poll_interval: Duration::from_millis(1_000),
            heartbeat_interval: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(30),
            worker_timeout: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config, index: usize) -> Self {
        Self {
            name: format!("worker-{index}"),
            max_concurrent_jobs: config.max_concurrent_jobs,
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
            watchdog_interval: config.watchdog_interval,
            worker_timeout: config.worker_timeout,
            graceful_shutdown_timeout: config.graceful_shutdown_timeout,
        }
    }
}

/// Per-job log line tickets, shared between a worker and the observer wired
/// into its runtime. Line numbers are strictly increasing per job, from 0.
#[derive(Clone, Default)]
pub struct LineCounters(Arc<Mutex<HashMap<Uuid, Arc<AtomicI32>>>>);

impl LineCounters {
    /// Install a fresh counter for a claim. Owned by the claiming worker;
    /// exposed for wiring observers in tests.
    pub fn install(&self, job_id: Uuid) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, Arc::new(AtomicI32::new(0)));
    }

    pub fn remove(&self, job_id: Uuid) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    /// Take the next ticket for a job, or `None` when the job is not claimed
    /// here (late output after the claim was released is dropped).
    pub fn next(&self, job_id: Uuid) -> Option<i32> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .map(|counter| counter.fetch_add(1, Ordering::SeqCst))
    }
}

/// Observer that persists progress and log lines through the store.
///
/// Constructed together with the worker and handed to the runtime at
/// construction, so no progress line can arrive before a sink exists.
pub struct StoreObserver {
    store: Arc<dyn JobStore>,
    counters: LineCounters,
}

impl StoreObserver {
    pub fn new(store: Arc<dyn JobStore>, counters: LineCounters) -> Self {
        Self { store, counters }
    }
}

#[async_trait]
impl ExecutionObserver for StoreObserver {
    async fn on_progress(&self, job_id: Uuid, progress: Progress) {
        match self.store.update_progress(job_id, progress).await {
            Ok(()) => {}
            Err(StoreError::InvalidTransition { .. }) => {
                // The job left `running` (cancel or orphan reset); late
                // progress is dropped on purpose.
                debug!(job_id = %job_id, "dropped progress update for non-running job");
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to persist progress"),
        }
    }

    async fn on_log(&self, job_id: Uuid, level: LogLevel, message: String) {
        let Some(line_number) = self.counters.next(job_id) else {
            debug!(job_id = %job_id, "dropped log line for unclaimed job");
            return;
        };
        if let Err(e) = self
            .store
            .append_log_line(job_id, line_number, level, &message)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to append log line");
        }
    }
}

struct JobHandle {
    cancel: CancellationToken,
}

/// Decrements the in-flight counter and releases per-job state when the
/// execute task ends, on success, failure and panic alike.
struct ActiveJobGuard {
    worker: Arc<Worker>,
    job_id: Uuid,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.worker.active.fetch_sub(1, Ordering::SeqCst);
        self.worker
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.job_id);
        self.worker.counters.remove(self.job_id);
    }
}

/// A long-running job execution agent.
pub struct Worker {
    id: Uuid,
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    secrets: Arc<dyn SecretStore>,
    runtime: Arc<dyn JobRuntime>,
    counters: LineCounters,
    running: Mutex<HashMap<Uuid, JobHandle>>,
    active: AtomicUsize,
    draining: AtomicBool,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        secrets: Arc<dyn SecretStore>,
        runtime: Arc<dyn JobRuntime>,
        counters: LineCounters,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::now_v7(),
            config,
            store,
            secrets,
            runtime,
            counters,
            running: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Trip the in-memory cancellation signal for a job claimed here.
    /// Returns false when this worker does not own the job.
    pub fn cancel_local(&self, job_id: Uuid) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.get(&job_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Register and run until the shutdown token fires, then drain.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let mut record = WorkerRecord::new(
            self.config.name.clone(),
            hostname,
            self.config.max_concurrent_jobs as i32,
        );
        record.id = self.id;
        self.store.register_worker(record).await?;

        info!(
            worker_id = %self.id,
            name = %self.config.name,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "worker starting"
        );

        tokio::join!(
            self.clone().poll_loop(),
            self.clone().heartbeat_loop(),
            self.clone().watchdog_loop(),
            self.clone().sweep_loop(),
        );

        self.drain().await;

        info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if self.draining.load(Ordering::SeqCst) {
                continue;
            }

            while self.active.load(Ordering::SeqCst) < self.config.max_concurrent_jobs {
                match self.store.claim_next_job(self.id).await {
                    Ok(Some(job)) => {
                        debug!(worker_id = %self.id, job_id = %job.id, job_name = %job.job_name, "claimed job");
                        self.clone().dispatch(job);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(worker_id = %self.id, error = %e, "failed to claim job");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        break;
                    }
                }
            }
        }
    }

    /// Launch the execute task for a claimed job, with a panic guard that
    /// records the failure and leaves the counters consistent.
    fn dispatch(self: Arc<Self>, job: Job) {
        let job_id = job.id;
        let cancel = CancellationToken::new();

        self.active.fetch_add(1, Ordering::SeqCst);
        self.counters.install(job_id);
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                job_id,
                JobHandle {
                    cancel: cancel.clone(),
                },
            );

        let worker = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let _guard = ActiveJobGuard {
                worker: Arc::clone(&worker),
                job_id,
            };
            worker.execute_job(job, cancel).await;
        });

        let worker = self;
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(worker_id = %worker.id, job_id = %job_id, "job execution task panicked");
                    if let Err(err) = worker
                        .store
                        .fail_job(job_id, Some(worker.id), "internal error: job execution panic")
                        .await
                    {
                        warn!(job_id = %job_id, error = %err, "failed to record panic failure");
                    }
                }
            }
        });
    }

    async fn execute_job(&self, job: Job, cancel: CancellationToken) {
        let job_id = job.id;

        let function = match job.function_id {
            Some(function_id) => self.store.get_function(function_id).await,
            None => {
                self.store
                    .get_function_by_name(&job.namespace, &job.job_name)
                    .await
            }
        };

        let function = match function {
            Ok(Some(function)) => function,
            Ok(None) => {
                self.record_terminal_failure(job_id, "function not found or deleted")
                    .await;
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to load function");
                self.record_terminal_failure(job_id, "failed to load function definition")
                    .await;
                return;
            }
        };

        if !function.enabled {
            self.record_terminal_failure(job_id, "function is disabled")
                .await;
            return;
        }
        if function.code.trim().is_empty() {
            self.record_terminal_failure(job_id, "function has no executable code")
                .await;
            return;
        }

        let permissions = function.permissions();
        let request = ExecutionRequest {
            job_id,
            job_name: job.job_name.clone(),
            namespace: job.namespace.clone(),
            payload: job.payload.clone(),
            retry_count: job.retry_count,
            max_duration: Duration::from_secs(job.max_duration_seconds.max(1) as u64),
            created_by: job.created_by.clone(),
            user_role: job.user_role.clone(),
            user_email: job.user_email.clone(),
        };

        let secrets = self.load_secrets(&job).await;

        let outcome = self
            .runtime
            .execute(
                &function.code,
                request,
                &permissions,
                cancel,
                None,
                secrets,
            )
            .await;

        match outcome {
            Ok(result) if result.cancelled => {
                // Storage already reflects `cancelled`; nothing to record.
                debug!(job_id = %job_id, "job subprocess exited after cancellation");
            }
            Ok(result) if result.success => {
                let value = result.result.unwrap_or(Value::Null);
                match self.store.complete_job(job_id, Some(self.id), value).await {
                    Ok(job) => {
                        info!(job_id = %job_id, job_name = %job.job_name, "job completed");
                    }
                    Err(StoreError::InvalidTransition { .. }) => {
                        warn!(job_id = %job_id, "completion discarded: job no longer running here");
                    }
                    Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job completed"),
                }
            }
            Ok(result) => {
                let message = result
                    .error
                    .unwrap_or_else(|| "job execution failed".to_string());
                self.fail_with_retry(job_id, &message).await;
            }
            Err(e) => {
                self.fail_with_retry(job_id, &format!("runtime error: {e:#}")).await;
            }
        }
    }

    async fn load_secrets(&self, job: &Job) -> HashMap<String, String> {
        let mut secrets = match self.secrets.namespace_secrets(&job.namespace).await {
            Ok(secrets) => secrets,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to load namespace secrets");
                HashMap::new()
            }
        };

        if let Some(created_by) = &job.created_by {
            match self.secrets.user_secrets(created_by).await {
                Ok(user_secrets) => secrets.extend(user_secrets),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to load user secrets");
                }
            }
        }

        secrets
    }

    /// Fail without retrying, for errors retrying cannot fix (missing or
    /// disabled function).
    async fn record_terminal_failure(&self, job_id: Uuid, message: &str) {
        warn!(job_id = %job_id, error = message, "job failed");
        match self.store.fail_job(job_id, Some(self.id), message).await {
            Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job failed"),
        }
    }

    /// Fail and re-enqueue while the retry budget lasts.
    async fn fail_with_retry(&self, job_id: Uuid, message: &str) {
        match self.store.fail_job(job_id, Some(self.id), message).await {
            Ok(failed) => {
                warn!(
                    job_id = %job_id,
                    job_name = %failed.job_name,
                    error = message,
                    retry_count = failed.retry_count,
                    max_retries = failed.max_retries,
                    "job failed"
                );
                if failed.can_retry() {
                    match self.store.requeue_job(job_id).await {
                        Ok(requeued) => {
                            info!(
                                job_id = %job_id,
                                retry_count = requeued.retry_count,
                                "job requeued for retry"
                            );
                        }
                        Err(StoreError::InvalidTransition { .. }) => {
                            debug!(job_id = %job_id, "requeue skipped: job state changed");
                        }
                        Err(e) => error!(job_id = %job_id, error = %e, "failed to requeue job"),
                    }
                }
            }
            Err(StoreError::InvalidTransition { .. }) => {
                warn!(job_id = %job_id, "failure discarded: job no longer running here");
            }
            Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job failed"),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let count = self.active.load(Ordering::SeqCst) as i32;
            match self.store.worker_heartbeat(self.id, count).await {
                Ok(()) => {}
                Err(StoreError::NotFound { .. }) => {
                    // Swept as stale (e.g. after a long pause). Re-register so
                    // the claim check accepts us again; our old claims were
                    // orphan-reset and their late completions will be refused.
                    warn!(worker_id = %self.id, "worker row missing, re-registering");
                    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
                    let mut record = WorkerRecord::new(
                        self.config.name.clone(),
                        hostname,
                        self.config.max_concurrent_jobs as i32,
                    );
                    record.id = self.id;
                    if let Err(e) = self.store.register_worker(record).await {
                        error!(worker_id = %self.id, error = %e, "failed to re-register worker");
                    }
                }
                Err(e) => warn!(worker_id = %self.id, error = %e, "heartbeat failed"),
            }
        }
    }

    /// Progress-timeout enforcement, doubling as the database cancel poll so
    /// cancellation reaches jobs running on workers outside the local
    /// process's manager.
    async fn watchdog_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.watchdog_interval) => {}
            }

            let ids: Vec<Uuid> = self
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .copied()
                .collect();

            for job_id in ids {
                let job = match self.store.get_job(job_id).await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        self.cancel_local(job_id);
                        continue;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "watchdog failed to read job");
                        continue;
                    }
                };

                if job.status == JobStatus::Cancelled || job.cancel_requested {
                    info!(job_id = %job_id, "cancel observed in storage, stopping subprocess");
                    self.cancel_local(job_id);
                    continue;
                }

                if job.status != JobStatus::Running || job.progress_timeout_seconds <= 0 {
                    continue;
                }

                let Some(last_progress_at) = job.last_progress_at else {
                    continue;
                };
                let stalled_for = Utc::now() - last_progress_at;
                if stalled_for > chrono::Duration::seconds(job.progress_timeout_seconds as i64) {
                    warn!(
                        job_id = %job_id,
                        stalled_secs = stalled_for.num_seconds(),
                        progress_timeout_seconds = job.progress_timeout_seconds,
                        "progress timeout, cancelling job"
                    );
                    self.cancel_local(job_id);
                    self.fail_with_retry(
                        job_id,
                        &format!(
                            "Progress timeout: no progress update within {}s",
                            job.progress_timeout_seconds
                        ),
                    )
                    .await;
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let half = self.config.worker_timeout / 2;
        let interval = half.max(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self
                .store
                .cleanup_stale_workers(self.config.worker_timeout)
                .await
            {
                Ok(swept) if swept > 0 => {
                    info!(worker_id = %self.id, swept, "removed stale workers");
                }
                Ok(_) => {}
                Err(e) => warn!(worker_id = %self.id, error = %e, "stale worker sweep failed"),
            }

            match self.store.reset_orphaned_jobs().await {
                Ok(reset) if reset > 0 => {
                    info!(worker_id = %self.id, reset, "reset orphaned jobs to pending");
                }
                Ok(_) => {}
                Err(e) => warn!(worker_id = %self.id, error = %e, "orphan reset failed"),
            }
        }
    }

    /// Refuse new claims, wait for in-flight jobs, then interrupt stragglers.
    async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        if let Err(e) = self
            .store
            .set_worker_status(self.id, WorkerStatus::Draining)
            .await
        {
            warn!(worker_id = %self.id, error = %e, "failed to mark worker draining");
        }

        let deadline = tokio::time::Instant::now() + self.config.graceful_shutdown_timeout;
        while self.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        if self.active.load(Ordering::SeqCst) > 0 {
            let remaining: Vec<Uuid> = {
                let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
                for handle in running.values() {
                    handle.cancel.cancel();
                }
                running.keys().copied().collect()
            };
            warn!(
                worker_id = %self.id,
                remaining = remaining.len(),
                "graceful shutdown timeout, interrupting remaining jobs"
            );

            for job_id in remaining {
                match self
                    .store
                    .interrupt_job(job_id, self.id, "interrupted by worker shutdown")
                    .await
                {
                    Ok(_) => {}
                    Err(StoreError::InvalidTransition { .. }) => {
                        // Finished in the window between the check and now.
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "failed to interrupt job"),
                }
            }

            // Let execute tasks observe the cancellation and unwind.
            let grace = tokio::time::Instant::now() + Duration::from_secs(2);
            while self.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < grace {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if let Err(e) = self
            .store
            .set_worker_status(self.id, WorkerStatus::Stopped)
            .await
        {
            warn!(worker_id = %self.id, error = %e, "failed to mark worker stopped");
        }
        if let Err(e) = self.store.deregister_worker(self.id).await {
            warn!(worker_id = %self.id, error = %e, "failed to deregister worker");
        }
    }
}
