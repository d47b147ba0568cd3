//! Job execution infrastructure: durable queue, workers, sandboxed runtime
//! and cron scheduling.
//!
//! # Architecture
//!
//! ```text
//! JobService.submit_job()
//!     │
//!     └─► JobStore.enqueue_job()            (row: pending)
//!
//! Worker (one of N, owned by WorkerManager)
//!     │
//!     ├─► poll loop: JobStore.claim_next_job()   (pending -> running,
//!     │       FOR UPDATE SKIP LOCKED, single claimer per row)
//!     ├─► execute task: JobRuntime.execute()     (sandboxed subprocess)
//!     │       ├─► __PROGRESS__:: lines -> JobStore.update_progress()
//!     │       ├─► other output        -> JobStore.append_log_line()
//!     │       └─► __RESULT__:: line   -> complete_job() / fail_job()
//!     ├─► watchdog loop: progress timeouts + cancel polling
//!     └─► sweep loop: stale workers + orphaned jobs
//!
//! FunctionScheduler
//!     │
//!     └─► cron tick -> re-read function -> JobStore.enqueue_job()
//! ```
//!
//! Cancellation is a two-step fire-and-forget: storage first (status flips to
//! `cancelled` immediately), then WorkerManager broadcasts to local workers;
//! an owner on another node notices via the `cancel_requested` flag its
//! watchdog polls.

pub mod bridge;
mod function;
mod job;
mod logs;
mod manager;
mod runtime;
mod scheduler;
mod service;
mod store;
pub mod testing;
mod worker;
mod workers;

pub use function::{FunctionFile, FunctionSource, JobFunction, Permissions};
pub use job::{Job, JobFilter, JobStatus, Progress};
pub use logs::{ExecutionLog, LogLevel};
pub use manager::WorkerManager;
pub use runtime::{
    ExecutionObserver, ExecutionRequest, ExecutionResult, JobRuntime, RuntimeOptions,
    SandboxRuntime, DENIED_ENV_VARS, SDK_ENV_ALLOWLIST,
};
pub use scheduler::{normalize_cron, parse_schedule, FunctionScheduler};
pub use service::{
    FunctionSpec, FunctionSpecFile, JobService, ServiceError, SubmitJob, Submitter, SyncAction,
    SyncDetail, SyncOptions, SyncResult, SyncSummary,
};
pub use store::{JobStore, PostgresJobStore, QueueStats, StoreError, StoreResult};
pub use worker::{LineCounters, StoreObserver, Worker, WorkerConfig};
pub use workers::{WorkerRecord, WorkerStatus};
