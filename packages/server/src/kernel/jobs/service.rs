//! Inbound library API for the job subsystem.
//!
//! The HTTP layer (out of this crate) is a thin facade over [`JobService`]:
//! submissions, job queries, cancellation, and the admin operations (function
//! sync, stats, workers, log tailing). The service receives an already-
//! authenticated submitter identity; role enforcement against a function's
//! `require_role` happens here, everything else upstream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::function::{FunctionFile, FunctionSource, JobFunction};
use super::job::{Job, JobFilter};
use super::logs::ExecutionLog;
use super::manager::WorkerManager;
use super::scheduler::FunctionScheduler;
use super::store::{JobStore, QueueStats, StoreError};
use super::workers::WorkerRecord;

/// Errors surfaced to the API facade.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("function is disabled: {0}")]
    Disabled(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad payload: {0}")]
    BadPayload(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ServiceError::NotFound(e.to_string()),
            StoreError::InvalidTransition { .. } => ServiceError::Conflict(e.to_string()),
            StoreError::Other(inner) => ServiceError::Internal(inner),
        }
    }
}

/// Already-authenticated submitter identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submitter {
    pub id: String,
    pub role: Option<String>,
    pub email: Option<String>,
}

/// A job submission.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct SubmitJob {
    #[builder(!default)]
    pub job_name: String,
    #[builder(setter(strip_option))]
    pub namespace: Option<String>,
    #[builder(setter(strip_option))]
    pub payload: Option<Value>,
    #[builder(setter(strip_option))]
    pub priority: Option<i32>,
    #[builder(setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(setter(strip_option))]
    pub submitter: Option<Submitter>,
}

/// One function definition as delivered by the deploy pipeline.
///
/// Annotation-derived limit fields tolerate a trailing `s` on numeric values
/// (`"300s"` parses as `300`).
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub original_code: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_timeout", deserialize_with = "lenient_limit")]
    pub timeout_seconds: i32,
    #[serde(default = "default_memory", deserialize_with = "lenient_limit")]
    pub memory_limit_mb: i32,
    #[serde(default, deserialize_with = "lenient_limit")]
    pub max_retries: i32,
    #[serde(default = "default_progress_timeout", deserialize_with = "lenient_limit")]
    pub progress_timeout_seconds: i32,
    #[serde(default = "default_true")]
    pub allow_net: bool,
    #[serde(default = "default_true")]
    pub allow_env: bool,
    #[serde(default)]
    pub allow_read: bool,
    #[serde(default)]
    pub allow_write: bool,
    #[serde(default)]
    pub require_role: Option<String>,
    #[serde(default)]
    pub source: FunctionSource,
    #[serde(default)]
    pub files: Vec<FunctionSpecFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionSpecFile {
    pub file_path: String,
    pub content: String,
}

fn default_true() -> bool {
    true
}
fn default_timeout() -> i32 {
    300
}
fn default_memory() -> i32 {
    256
}
fn default_progress_timeout() -> i32 {
    60
}

/// Accept `300`, `"300"` and `"300s"` for annotation-derived limits.
fn lenient_limit<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n as i32),
        Raw::Str(s) => {
            let trimmed = s.trim();
            let trimmed = trimmed.strip_suffix('s').unwrap_or(trimmed);
            trimmed
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid numeric value {s:?}")))
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub delete_missing: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncDetail {
    pub name: String,
    pub action: SyncAction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub summary: SyncSummary,
    pub details: Vec<SyncDetail>,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

/// Library API over queue storage, the local worker manager and the
/// scheduler.
pub struct JobService {
    store: Arc<dyn JobStore>,
    manager: Option<Arc<WorkerManager>>,
    scheduler: Option<Arc<FunctionScheduler>>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            manager: None,
            scheduler: None,
        }
    }

    /// Wire the local worker manager for in-process cancellation fan-out.
    pub fn with_manager(mut self, manager: Arc<WorkerManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Wire the scheduler so catalog changes re-reconcile cron entries.
    pub fn with_scheduler(mut self, scheduler: Arc<FunctionScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    // Submission and job queries -------------------------------------------

    pub async fn submit_job(&self, submit: SubmitJob) -> Result<Job, ServiceError> {
        let namespace = submit.namespace.as_deref().unwrap_or("default");

        let function = self
            .store
            .get_function_by_name(namespace, &submit.job_name)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("function {}/{}", namespace, submit.job_name))
            })?;

        if !function.enabled {
            return Err(ServiceError::Disabled(format!(
                "{}/{}",
                namespace, submit.job_name
            )));
        }

        if let Some(required) = &function.require_role {
            match &submit.submitter {
                None => {
                    return Err(ServiceError::Forbidden(format!(
                        "function requires role {required}"
                    )));
                }
                Some(submitter) => {
                    let role = submitter.role.as_deref().unwrap_or("");
                    if role != required && role != "admin" {
                        return Err(ServiceError::Forbidden(format!(
                            "function requires role {required}"
                        )));
                    }
                }
            }
        }

        if let Some(payload) = &submit.payload {
            if !payload.is_object() && !payload.is_null() {
                return Err(ServiceError::BadPayload(
                    "payload must be a JSON object".to_string(),
                ));
            }
        }

        let mut job = Job::builder()
            .namespace(function.namespace.clone())
            .function_id(function.id)
            .job_name(function.name.clone())
            .priority(submit.priority.unwrap_or(0))
            .max_duration_seconds(function.timeout_seconds)
            .progress_timeout_seconds(function.progress_timeout_seconds)
            .max_retries(function.max_retries)
            .build();
        job.payload = submit.payload;
        job.scheduled_at = submit.scheduled_at;
        if let Some(submitter) = submit.submitter {
            job.created_by = Some(submitter.id);
            job.user_role = submitter.role;
            job.user_email = submitter.email;
        }

        let job = self.store.enqueue_job(job).await?;
        info!(job_id = %job.id, job_name = %job.job_name, namespace = %job.namespace, "job submitted");
        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, ServiceError> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("job {id}")))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, ServiceError> {
        Ok(self.store.list_jobs(filter).await?)
    }

    /// Cancel a job: storage first (so status reads observe it immediately),
    /// then the in-memory broadcast so a locally running subprocess dies
    /// promptly. Remote owners pick the cancel up from the row flag.
    pub async fn cancel_job(&self, id: Uuid) -> Result<Job, ServiceError> {
        let job = self.store.cancel_job(id).await?;
        if let Some(manager) = &self.manager {
            manager.cancel_job(id);
        }
        info!(job_id = %id, "job cancelled");
        Ok(job)
    }

    /// Admin termination. Same two-step as `cancel_job`; kept separate so
    /// the facade can gate it behind admin privileges.
    pub async fn terminate_job(&self, id: Uuid) -> Result<Job, ServiceError> {
        self.cancel_job(id).await
    }

    /// Admin retry of a failed, cancelled or interrupted job. Does not
    /// consume the automatic retry budget.
    pub async fn retry_job(&self, id: Uuid) -> Result<Job, ServiceError> {
        let job = self.store.restart_job(id).await?;
        info!(job_id = %id, "job queued for manual retry");
        Ok(job)
    }

    /// Clone a job into a fresh pending instance with a clean retry budget.
    pub async fn resubmit_job(&self, id: Uuid) -> Result<Job, ServiceError> {
        let original = self.get_job(id).await?;

        let mut clone = Job::builder()
            .namespace(original.namespace.clone())
            .job_name(original.job_name.clone())
            .priority(original.priority)
            .max_duration_seconds(original.max_duration_seconds)
            .progress_timeout_seconds(original.progress_timeout_seconds)
            .max_retries(original.max_retries)
            .build();
        clone.function_id = original.function_id;
        clone.payload = original.payload.clone();
        clone.created_by = original.created_by.clone();
        clone.user_role = original.user_role.clone();
        clone.user_email = original.user_email.clone();

        let job = self.store.enqueue_job(clone).await?;
        info!(job_id = %job.id, resubmitted_from = %id, "job resubmitted");
        Ok(job)
    }

    pub async fn get_job_logs(
        &self,
        id: Uuid,
        after_line: Option<i32>,
    ) -> Result<Vec<ExecutionLog>, ServiceError> {
        // Listing logs for an unknown job is a NotFound, not an empty list.
        self.get_job(id).await?;
        Ok(self.store.list_logs(id, after_line).await?)
    }

    // Admin: functions ------------------------------------------------------

    pub async fn list_functions(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<JobFunction>, ServiceError> {
        Ok(self.store.list_functions(namespace).await?)
    }

    pub async fn update_function(
        &self,
        function: JobFunction,
    ) -> Result<JobFunction, ServiceError> {
        let namespace = function.namespace.clone();
        let updated = self.store.update_function(function).await?;
        self.reschedule(&namespace).await;
        Ok(updated)
    }

    pub async fn delete_function(&self, id: Uuid) -> Result<bool, ServiceError> {
        let function = self.store.get_function(id).await?;
        let deleted = self.store.delete_function(id).await?;
        if let Some(function) = function {
            self.reschedule(&function.namespace).await;
        }
        Ok(deleted)
    }

    /// Reconcile a namespace's declared functions against the catalog.
    ///
    /// With `dry_run` nothing is written and the summary is the projection of
    /// what a real run would do. A real run re-schedules the namespace.
    pub async fn sync_functions(
        &self,
        namespace: &str,
        specs: Vec<FunctionSpec>,
        options: SyncOptions,
    ) -> Result<SyncResult, ServiceError> {
        let existing = self.store.list_functions(Some(namespace)).await?;

        let mut summary = SyncSummary::default();
        let mut details = Vec::new();
        let mut errors = Vec::new();

        for spec in &specs {
            let current = existing.iter().find(|f| f.name == spec.name);
            let action = match current {
                None => SyncAction::Created,
                Some(current) if spec_differs(current, spec) => SyncAction::Updated,
                Some(_) => SyncAction::Unchanged,
            };

            if !options.dry_run && action != SyncAction::Unchanged {
                let mut function = function_from_spec(namespace, spec);
                if let Some(current) = current {
                    function.id = current.id;
                }
                match self.store.upsert_function(function).await {
                    Ok(stored) => {
                        for file in &spec.files {
                            let file =
                                FunctionFile::new(stored.id, &file.file_path, &file.content);
                            if let Err(e) = self.store.upsert_function_file(file).await {
                                warn!(name = %spec.name, error = %e, "failed to sync function file");
                                errors.push(format!("{}: {e}", spec.name));
                                summary.errors += 1;
                            }
                        }
                    }
                    Err(e) => {
                        errors.push(format!("{}: {e}", spec.name));
                        summary.errors += 1;
                        continue;
                    }
                }
            }

            match action {
                SyncAction::Created => summary.created += 1,
                SyncAction::Updated => summary.updated += 1,
                SyncAction::Unchanged => summary.unchanged += 1,
                SyncAction::Deleted => {}
            }
            details.push(SyncDetail {
                name: spec.name.clone(),
                action,
            });
        }

        if options.delete_missing {
            for function in &existing {
                if specs.iter().any(|s| s.name == function.name) {
                    continue;
                }
                if !options.dry_run {
                    if let Err(e) = self.store.delete_function(function.id).await {
                        errors.push(format!("{}: {e}", function.name));
                        summary.errors += 1;
                        continue;
                    }
                }
                summary.deleted += 1;
                details.push(SyncDetail {
                    name: function.name.clone(),
                    action: SyncAction::Deleted,
                });
            }
        }

        if !options.dry_run {
            self.reschedule(namespace).await;
        }

        info!(
            namespace = %namespace,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            unchanged = summary.unchanged,
            errors = summary.errors,
            dry_run = options.dry_run,
            "function sync finished"
        );

        Ok(SyncResult {
            summary,
            details,
            errors,
            dry_run: options.dry_run,
        })
    }

    // Admin: observability --------------------------------------------------

    pub async fn get_stats(&self) -> Result<QueueStats, ServiceError> {
        Ok(self.store.queue_stats().await?)
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>, ServiceError> {
        Ok(self.store.list_workers().await?)
    }

    async fn reschedule(&self, namespace: &str) {
        if let Some(scheduler) = &self.scheduler {
            if let Err(e) = scheduler.reconcile_schedules(Some(namespace)).await {
                warn!(namespace = %namespace, error = %e, "failed to reconcile schedules");
            }
        }
    }
}

/// Build the catalog row a spec describes.
fn function_from_spec(namespace: &str, spec: &FunctionSpec) -> JobFunction {
    let mut function = JobFunction::builder()
        .name(spec.name.clone())
        .namespace(namespace.to_string())
        .code(spec.code.clone())
        .build();
    function.original_code = spec
        .original_code
        .clone()
        .unwrap_or_else(|| spec.code.clone());
    function.enabled = spec.enabled;
    function.schedule = spec.schedule.clone();
    function.timeout_seconds = spec.timeout_seconds;
    function.memory_limit_mb = spec.memory_limit_mb;
    function.max_retries = spec.max_retries;
    function.progress_timeout_seconds = spec.progress_timeout_seconds;
    function.allow_net = spec.allow_net;
    function.allow_env = spec.allow_env;
    function.allow_read = spec.allow_read;
    function.allow_write = spec.allow_write;
    function.require_role = spec.require_role.clone();
    function.source = spec.source;
    function
}

fn spec_differs(current: &JobFunction, spec: &FunctionSpec) -> bool {
    current.code != spec.code
        || current.enabled != spec.enabled
        || current.schedule != spec.schedule
        || current.timeout_seconds != spec.timeout_seconds
        || current.memory_limit_mb != spec.memory_limit_mb
        || current.max_retries != spec.max_retries
        || current.progress_timeout_seconds != spec.progress_timeout_seconds
        || current.allow_net != spec.allow_net
        || current.allow_env != spec.allow_env
        || current.allow_read != spec.allow_read
        || current.allow_write != spec.allow_write
        || current.require_role != spec.require_role
}
