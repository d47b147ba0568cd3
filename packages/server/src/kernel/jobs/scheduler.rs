//! Cron scheduling of job functions using tokio-cron-scheduler.
//!
//! A function's `schedule` string is `<cron-expr>`, optionally suffixed with
//! `|<json-params>`. Every tick re-reads the function from storage (so
//! disabling takes effect without a reschedule), applies a bounded-concurrency
//! backpressure check, and enqueues a system-triggered job instance at
//! priority 0.
//!
//! `reconcile_schedules` is the single entry point: startup, sync and
//! function create/update/delete all diff the desired schedule set against
//! what the cron engine currently runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::function::JobFunction;
use super::job::Job;
use super::store::JobStore;

/// Ticks are skipped once this many submissions are in flight.
pub const DEFAULT_MAX_CONCURRENT_SUBMISSIONS: usize = 20;

/// Split a schedule string into its cron expression and JSON params.
///
/// Malformed JSON after the `|` means the whole string is treated as the
/// expression and the params default to empty.
pub fn parse_schedule(raw: &str) -> (String, serde_json::Map<String, Value>) {
    if let Some((expr, params_json)) = raw.split_once('|') {
        if let Ok(Value::Object(params)) = serde_json::from_str::<Value>(params_json.trim()) {
            return (expr.trim().to_string(), params);
        }
    }
    (raw.trim().to_string(), serde_json::Map::new())
}

/// Normalise a five-field cron expression by prepending a seconds field; six
/// and seven field expressions pass through untouched.
pub fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

struct ScheduledEntry {
    cron_id: Uuid,
    /// The raw schedule string the entry was registered with, for change
    /// detection during reconcile.
    schedule: String,
}

/// Schedules enabled functions with cron expressions.
pub struct FunctionScheduler {
    store: Arc<dyn JobStore>,
    engine: JobScheduler,
    entries: Mutex<HashMap<(String, String), ScheduledEntry>>,
    active_submissions: Arc<AtomicUsize>,
    max_concurrent_submissions: usize,
}

impl FunctionScheduler {
    pub async fn new(store: Arc<dyn JobStore>) -> Result<Self> {
        let engine = JobScheduler::new()
            .await
            .context("failed to create cron engine")?;

        Ok(Self {
            store,
            engine,
            entries: Mutex::new(HashMap::new()),
            active_submissions: Arc::new(AtomicUsize::new(0)),
            max_concurrent_submissions: DEFAULT_MAX_CONCURRENT_SUBMISSIONS,
        })
    }

    /// Start the cron engine and load schedules in the background.
    ///
    /// The engine starts before the catalog load so a slow or still-
    /// initialising datastore cannot block server startup; the load retries
    /// with doubling backoff.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.engine
            .start()
            .await
            .context("failed to start cron engine")?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.load_with_backoff().await;
        });

        Ok(())
    }

    async fn load_with_backoff(&self) {
        let mut delay = Duration::from_millis(100);
        for attempt in 1..=5 {
            match self.reconcile_schedules(None).await {
                Ok(count) => {
                    info!(scheduled = count, "cron schedules loaded");
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "failed to load cron schedules, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        error!("giving up on loading cron schedules after 5 attempts");
    }

    /// Diff the desired schedule set (enabled functions with a schedule,
    /// optionally scoped to one namespace) against the registered cron
    /// entries; remove what is gone or changed, add what is missing.
    /// Idempotent. Returns the number of entries registered in scope.
    pub async fn reconcile_schedules(&self, namespace: Option<&str>) -> Result<usize> {
        let functions = self.store.list_functions(namespace).await?;

        let desired: HashMap<(String, String), &JobFunction> = functions
            .iter()
            .filter(|f| f.enabled && f.schedule.is_some())
            .map(|f| ((f.namespace.clone(), f.name.clone()), f))
            .collect();

        let mut entries = self.entries.lock().await;

        let in_scope: Vec<(String, String)> = entries
            .keys()
            .filter(|(ns, _)| namespace.map_or(true, |scope| ns == scope))
            .cloned()
            .collect();

        for key in in_scope {
            let keep = desired
                .get(&key)
                .and_then(|f| f.schedule.as_deref())
                .map_or(false, |schedule| {
                    entries
                        .get(&key)
                        .map_or(false, |entry| entry.schedule == schedule)
                });
            if !keep {
                if let Some(entry) = entries.remove(&key) {
                    if let Err(e) = self.engine.remove(&entry.cron_id).await {
                        warn!(namespace = %key.0, name = %key.1, error = %e, "failed to remove cron entry");
                    } else {
                        info!(namespace = %key.0, name = %key.1, "unscheduled function");
                    }
                }
            }
        }

        for (key, function) in &desired {
            if entries.contains_key(key) {
                continue;
            }
            let schedule = function.schedule.clone().unwrap_or_default();
            match self.register(function).await {
                Ok(cron_id) => {
                    info!(namespace = %key.0, name = %key.1, schedule = %schedule, "scheduled function");
                    entries.insert(key.clone(), ScheduledEntry { cron_id, schedule });
                }
                Err(e) => {
                    warn!(namespace = %key.0, name = %key.1, schedule = %schedule, error = %e, "invalid schedule, skipping");
                }
            }
        }

        Ok(entries
            .keys()
            .filter(|(ns, _)| namespace.map_or(true, |scope| ns == scope))
            .count())
    }

    async fn register(&self, function: &JobFunction) -> Result<Uuid> {
        let raw = function
            .schedule
            .clone()
            .context("function has no schedule")?;
        let (expr, params) = parse_schedule(&raw);
        let expr = normalize_cron(&expr);

        let store = Arc::clone(&self.store);
        let counter = Arc::clone(&self.active_submissions);
        let max = self.max_concurrent_submissions;
        let namespace = function.namespace.clone();
        let name = function.name.clone();

        let cron_job = CronJob::new_async(expr.as_str(), move |_uuid, _lock| {
            let store = Arc::clone(&store);
            let counter = Arc::clone(&counter);
            let params = params.clone();
            let namespace = namespace.clone();
            let name = name.clone();
            Box::pin(async move {
                if let Err(e) = run_cron_tick(store, counter, max, &namespace, &name, params).await
                {
                    error!(namespace = %namespace, name = %name, error = %e, "cron submission failed");
                }
            })
        })
        .with_context(|| format!("invalid cron expression {expr:?}"))?;

        let cron_id = self
            .engine
            .add(cron_job)
            .await
            .context("failed to add cron entry")?;

        Ok(cron_id)
    }

    /// Number of currently registered cron entries.
    pub async fn scheduled_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Stop the engine and wait (bounded) for in-flight submissions.
    pub async fn shutdown(&self) -> Result<()> {
        let mut engine = self.engine.clone();
        engine
            .shutdown()
            .await
            .context("failed to shut down cron engine")?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while self.active_submissions.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(())
    }
}

struct SubmissionGuard(Arc<AtomicUsize>);

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One scheduler tick: backpressure check, re-read of the function, enqueue.
pub(crate) async fn run_cron_tick(
    store: Arc<dyn JobStore>,
    counter: Arc<AtomicUsize>,
    max_concurrent_submissions: usize,
    namespace: &str,
    name: &str,
    params: serde_json::Map<String, Value>,
) -> Result<()> {
    if counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current < max_concurrent_submissions).then_some(current + 1)
        })
        .is_err()
    {
        warn!(
            namespace = %namespace,
            name = %name,
            limit = max_concurrent_submissions,
            "skipping cron tick: submission backpressure limit reached"
        );
        return Ok(());
    }
    let _guard = SubmissionGuard(counter);

    // Re-read so a disable or delete takes effect without a reschedule.
    let Some(function) = store.get_function_by_name(namespace, name).await? else {
        return Ok(());
    };
    if !function.enabled {
        return Ok(());
    }

    let mut payload = serde_json::Map::new();
    payload.insert("_trigger".to_string(), Value::String("cron".to_string()));
    payload.insert(
        "_scheduled_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    payload.extend(params);

    let job = Job::builder()
        .namespace(function.namespace.clone())
        .function_id(function.id)
        .job_name(function.name.clone())
        .payload(Value::Object(payload))
        .priority(0)
        .max_duration_seconds(function.timeout_seconds)
        .progress_timeout_seconds(function.progress_timeout_seconds)
        .max_retries(function.max_retries)
        .build();

    let job = store.enqueue_job(job).await?;
    info!(job_id = %job.id, namespace = %namespace, name = %name, "cron job enqueued");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_without_params() {
        let (expr, params) = parse_schedule("*/5 * * * *");
        assert_eq!(expr, "*/5 * * * *");
        assert!(params.is_empty());
    }

    #[test]
    fn schedule_with_params() {
        let (expr, params) = parse_schedule(r#"*/5 * * * *|{"type":"daily"}"#);
        assert_eq!(expr, "*/5 * * * *");
        assert_eq!(params.get("type"), Some(&Value::String("daily".into())));
    }

    #[test]
    fn malformed_params_fall_back_to_whole_string() {
        let raw = "*/5 * * * *|{not json";
        let (expr, params) = parse_schedule(raw);
        assert_eq!(expr, raw);
        assert!(params.is_empty());
    }

    #[test]
    fn five_field_cron_gets_a_seconds_field() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn six_field_cron_passes_through() {
        assert_eq!(normalize_cron("0 0 * * * MON"), "0 0 * * * MON");
    }

    use super::super::testing::MemoryJobStore;
    use crate::kernel::jobs::{JobFilter, JobStore};

    async fn seed_scheduled_function(store: &Arc<dyn JobStore>, schedule: &str) -> JobFunction {
        let mut function = JobFunction::builder()
            .name("nightly".to_string())
            .code("export function handler() {}".to_string())
            .build();
        function.schedule = Some(schedule.to_string());
        function.max_retries = 1;
        store.create_function(function).await.unwrap()
    }

    #[tokio::test]
    async fn tick_enqueues_a_system_job_with_trigger_payload() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let function =
            seed_scheduled_function(&store, r#"*/5 * * * *|{"type":"daily"}"#).await;
        let (_, params) = parse_schedule(function.schedule.as_deref().unwrap());

        run_cron_tick(
            Arc::clone(&store),
            Arc::new(AtomicUsize::new(0)),
            DEFAULT_MAX_CONCURRENT_SUBMISSIONS,
            "default",
            "nightly",
            params,
        )
        .await
        .unwrap();

        let jobs = store
            .list_jobs(&JobFilter::builder().include_result(true).build())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.priority, 0);
        assert_eq!(job.max_retries, 1);
        assert!(job.created_by.is_none());

        let payload = job.payload.as_ref().unwrap();
        assert_eq!(payload["_trigger"], Value::String("cron".into()));
        assert!(payload["_scheduled_at"].is_string());
        assert_eq!(payload["type"], Value::String("daily".into()));
    }

    #[tokio::test]
    async fn tick_skips_disabled_functions() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let mut function = seed_scheduled_function(&store, "*/5 * * * *").await;
        function.enabled = false;
        store.update_function(function).await.unwrap();

        run_cron_tick(
            Arc::clone(&store),
            Arc::new(AtomicUsize::new(0)),
            DEFAULT_MAX_CONCURRENT_SUBMISSIONS,
            "default",
            "nightly",
            serde_json::Map::new(),
        )
        .await
        .unwrap();

        let jobs = store.list_jobs(&JobFilter::builder().build()).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn tick_respects_the_backpressure_limit() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        seed_scheduled_function(&store, "*/5 * * * *").await;

        // Counter already at the cap: the tick must be skipped.
        let counter = Arc::new(AtomicUsize::new(DEFAULT_MAX_CONCURRENT_SUBMISSIONS));
        run_cron_tick(
            Arc::clone(&store),
            Arc::clone(&counter),
            DEFAULT_MAX_CONCURRENT_SUBMISSIONS,
            "default",
            "nightly",
            serde_json::Map::new(),
        )
        .await
        .unwrap();

        let jobs = store.list_jobs(&JobFilter::builder().build()).await.unwrap();
        assert!(jobs.is_empty());
        // A skipped tick must not leak counter slots.
        assert_eq!(counter.load(Ordering::SeqCst), DEFAULT_MAX_CONCURRENT_SUBMISSIONS);
    }

    #[tokio::test]
    async fn reconcile_adds_updates_and_removes_entries() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let function = seed_scheduled_function(&store, "*/5 * * * *").await;

        let scheduler = Arc::new(FunctionScheduler::new(Arc::clone(&store)).await.unwrap());
        assert_eq!(scheduler.reconcile_schedules(None).await.unwrap(), 1);
        assert_eq!(scheduler.scheduled_count().await, 1);

        // Idempotent.
        assert_eq!(scheduler.reconcile_schedules(None).await.unwrap(), 1);
        assert_eq!(scheduler.scheduled_count().await, 1);

        // Disabling drops the entry.
        let mut disabled = function.clone();
        disabled.enabled = false;
        store.update_function(disabled).await.unwrap();
        assert_eq!(scheduler.reconcile_schedules(None).await.unwrap(), 0);
        assert_eq!(scheduler.scheduled_count().await, 0);
    }

    #[tokio::test]
    async fn reconcile_skips_unparseable_schedules() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        seed_scheduled_function(&store, "not a cron expression").await;

        let scheduler = Arc::new(FunctionScheduler::new(Arc::clone(&store)).await.unwrap());
        assert_eq!(scheduler.reconcile_schedules(None).await.unwrap(), 0);
    }
}
