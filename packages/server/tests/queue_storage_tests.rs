//! Queue storage integration tests against a real Postgres.

mod common;

use common::{postgres_store, registered_worker, sample_function, sample_job};
use fluxbase_core::kernel::jobs::{
    Job, JobFilter, JobStatus, LogLevel, Progress, StoreError, WorkerRecord,
};
use serde_json::json;

#[tokio::test]
async fn enqueue_claim_complete_roundtrip() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let mut job = sample_job("sum");
    job.payload = Some(json!({"n": 3}));
    let job = store.enqueue_job(job).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let claimed = store.claim_next_job(worker.id).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.worker_id, Some(worker.id));
    assert!(claimed.started_at.is_some());
    assert!(claimed.last_progress_at.is_some());

    let result = json!({"sum": 6});
    let completed = store
        .complete_job(job.id, Some(worker.id), result.clone())
        .await
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);

    let fetched = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, JobStatus::Completed);
    assert_eq!(fetched.result, Some(result));
    assert_eq!(fetched.retry_count, 0);
    assert!(fetched.started_at.unwrap() <= fetched.completed_at.unwrap());
}

#[tokio::test]
async fn claim_requires_a_registered_worker() {
    let (store, _pool) = postgres_store().await;
    store.enqueue_job(sample_job("sum")).await.unwrap();

    // Never registered: the claim must refuse to bind the job.
    let ghost = uuid::Uuid::new_v4();
    assert!(store.claim_next_job(ghost).await.unwrap().is_none());

    let job = store
        .list_jobs(&JobFilter::builder().build())
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let low_old = store.enqueue_job(sample_job("low-old")).await.unwrap();
    let mut high = sample_job("high");
    high.priority = 10;
    let high = store.enqueue_job(high).await.unwrap();
    let _low_new = store.enqueue_job(sample_job("low-new")).await.unwrap();

    let first = store.claim_next_job(worker.id).await.unwrap().unwrap();
    assert_eq!(first.id, high.id);

    let second = store.claim_next_job(worker.id).await.unwrap().unwrap();
    assert_eq!(second.id, low_old.id);
}

#[tokio::test]
async fn claim_skips_jobs_scheduled_in_the_future() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let mut job = sample_job("later");
    job.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    store.enqueue_job(job).await.unwrap();

    assert!(store.claim_next_job(worker.id).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_claims_take_distinct_jobs() {
    let (store, _pool) = postgres_store().await;
    let worker_a = registered_worker(&store).await;
    let worker_b = store
        .register_worker(WorkerRecord::new("worker-b", "test-host", 5))
        .await
        .unwrap();

    store.enqueue_job(sample_job("solo")).await.unwrap();

    let (a, b) = tokio::join!(
        store.claim_next_job(worker_a.id),
        store.claim_next_job(worker_b.id),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // Exactly one of the two gets the single pending job.
    assert!(a.is_some() ^ b.is_some());
}

#[tokio::test]
async fn transitions_require_running_status() {
    let (store, _pool) = postgres_store().await;
    let job = store.enqueue_job(sample_job("sum")).await.unwrap();

    let complete = store.complete_job(job.id, None, json!(null)).await;
    assert!(matches!(
        complete,
        Err(StoreError::InvalidTransition { .. })
    ));

    let fail = store.fail_job(job.id, None, "boom").await;
    assert!(matches!(fail, Err(StoreError::InvalidTransition { .. })));
}

#[tokio::test]
async fn stale_worker_sweep_orphans_and_recovers_jobs() {
    let (store, pool) = postgres_store().await;
    let worker_a = registered_worker(&store).await;

    let job = store.enqueue_job(sample_job("orphan")).await.unwrap();
    let claimed = store.claim_next_job(worker_a.id).await.unwrap().unwrap();
    assert_eq!(claimed.worker_id, Some(worker_a.id));

    // Age worker A's heartbeat past the timeout.
    sqlx::query("UPDATE workers SET last_heartbeat_at = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(worker_a.id)
        .execute(&pool)
        .await
        .unwrap();

    let swept = store
        .cleanup_stale_workers(std::time::Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(swept, 1);

    // FK null-out marks the job as orphaned while still `running`.
    let orphan = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, JobStatus::Running);
    assert!(orphan.worker_id.is_none());

    let reset = store.reset_orphaned_jobs().await.unwrap();
    assert_eq!(reset, 1);
    let pending = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert!(pending.started_at.is_none());

    // Worker B claims the orphan; worker A's late completion is refused and
    // changes nothing.
    let worker_b = store
        .register_worker(WorkerRecord::new("worker-b", "test-host", 5))
        .await
        .unwrap();
    let reclaimed = store.claim_next_job(worker_b.id).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);

    let stale_completion = store
        .complete_job(job.id, Some(worker_a.id), json!({"late": true}))
        .await;
    assert!(matches!(
        stale_completion,
        Err(StoreError::InvalidTransition { .. })
    ));
    let unchanged = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, JobStatus::Running);
    assert_eq!(unchanged.worker_id, Some(worker_b.id));
    assert!(unchanged.result.is_none());
}

#[tokio::test]
async fn cancel_pending_and_running_but_not_terminal() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let pending = store.enqueue_job(sample_job("a")).await.unwrap();
    let cancelled = store.cancel_job(pending.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    // Never left running, so no completion timestamp.
    assert!(cancelled.completed_at.is_none());

    let running = store.enqueue_job(sample_job("b")).await.unwrap();
    store.claim_next_job(worker.id).await.unwrap().unwrap();
    let cancelled = store.cancel_job(running.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.cancel_requested);
    assert!(cancelled.completed_at.is_some());

    // Cancelling a terminal job is a conflict and leaves the row unchanged.
    let again = store.cancel_job(running.id).await;
    assert!(matches!(again, Err(StoreError::InvalidTransition { .. })));
    let after = store.get_job(running.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    assert_eq!(after.completed_at, cancelled.completed_at);
}

#[tokio::test]
async fn requeue_consumes_retry_budget() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let mut job = sample_job("flaky");
    job.max_retries = 1;
    let job = store.enqueue_job(job).await.unwrap();

    store.claim_next_job(worker.id).await.unwrap().unwrap();
    store
        .fail_job(job.id, Some(worker.id), "boom")
        .await
        .unwrap();

    let requeued = store.requeue_job(job.id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.worker_id.is_none());
    assert!(requeued.started_at.is_none());
    assert!(requeued.error_message.is_none());
    assert!(requeued.completed_at.is_none());

    // Budget exhausted: second failure cannot be requeued.
    store.claim_next_job(worker.id).await.unwrap().unwrap();
    store
        .fail_job(job.id, Some(worker.id), "boom again")
        .await
        .unwrap();
    let refused = store.requeue_job(job.id).await;
    assert!(matches!(refused, Err(StoreError::InvalidTransition { .. })));
}

#[tokio::test]
async fn zero_retry_job_fails_once_and_stays_failed() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let job = store.enqueue_job(sample_job("once")).await.unwrap();
    store.claim_next_job(worker.id).await.unwrap().unwrap();
    store.fail_job(job.id, Some(worker.id), "no").await.unwrap();

    let refused = store.requeue_job(job.id).await;
    assert!(matches!(refused, Err(StoreError::InvalidTransition { .. })));
    let after = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Failed);
}

#[tokio::test]
async fn restart_recovers_cancelled_and_interrupted_jobs() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let job = store.enqueue_job(sample_job("restartable")).await.unwrap();
    store.claim_next_job(worker.id).await.unwrap().unwrap();
    store
        .interrupt_job(job.id, worker.id, "interrupted by worker shutdown")
        .await
        .unwrap();

    let restarted = store.restart_job(job.id).await.unwrap();
    assert_eq!(restarted.status, JobStatus::Pending);
    assert!(restarted.error_message.is_none());
    // Manual restart leaves the automatic budget untouched.
    assert_eq!(restarted.retry_count, 0);
}

#[tokio::test]
async fn interrupt_requires_the_owning_worker() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let job = store.enqueue_job(sample_job("owned")).await.unwrap();
    store.claim_next_job(worker.id).await.unwrap().unwrap();

    let not_owner = store
        .interrupt_job(job.id, uuid::Uuid::new_v4(), "nope")
        .await;
    assert!(matches!(not_owner, Err(StoreError::InvalidTransition { .. })));
}

#[tokio::test]
async fn progress_updates_are_monotone_and_survive_cancel() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    let job = store.enqueue_job(sample_job("progressive")).await.unwrap();
    let claimed = store.claim_next_job(worker.id).await.unwrap().unwrap();
    let initial = claimed.last_progress_at.unwrap();

    store
        .update_progress(
            job.id,
            Progress {
                percent: 50.0,
                message: Some("halfway".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let updated = store.get_job(job.id).await.unwrap().unwrap();
    assert!(updated.last_progress_at.unwrap() >= initial);
    assert_eq!(updated.progress_snapshot().unwrap().percent, 50.0);

    // Cancelled jobs keep their last snapshot and refuse further updates.
    store.cancel_job(job.id).await.unwrap();
    let refused = store
        .update_progress(job.id, Progress::default())
        .await;
    assert!(matches!(refused, Err(StoreError::InvalidTransition { .. })));

    let after = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(after.progress_snapshot().unwrap().percent, 50.0);
    assert_eq!(
        after.progress_snapshot().unwrap().message.as_deref(),
        Some("halfway")
    );
}

#[tokio::test]
async fn log_lines_list_in_order_with_cursor() {
    let (store, _pool) = postgres_store().await;
    let job = store.enqueue_job(sample_job("chatty")).await.unwrap();

    for (n, message) in ["starting", "working", "done"].iter().enumerate() {
        store
            .append_log_line(job.id, n as i32, LogLevel::Info, message)
            .await
            .unwrap();
    }

    let all = store.list_logs(job.id, None).await.unwrap();
    assert_eq!(
        all.iter().map(|l| l.line_number).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let tail = store.list_logs(job.id, Some(0)).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].message, "working");
}

#[tokio::test]
async fn listing_omits_large_columns_unless_opted_in() {
    let (store, _pool) = postgres_store().await;

    let mut job = sample_job("fat");
    job.payload = Some(json!({"big": "blob"}));
    let job = store.enqueue_job(job).await.unwrap();

    let slim = store
        .list_jobs(&JobFilter::builder().build())
        .await
        .unwrap();
    assert!(slim[0].payload.is_none());

    let full = store
        .list_jobs(&JobFilter::builder().include_result(true).build())
        .await
        .unwrap();
    assert_eq!(full[0].payload, Some(json!({"big": "blob"})));

    // Filters narrow by name/status.
    let by_name = store
        .list_jobs(
            &JobFilter::builder()
                .job_name("fat".to_string())
                .status(JobStatus::Pending)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name[0].id, job.id);

    let none = store
        .list_jobs(&JobFilter::builder().job_name("other".to_string()).build())
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn function_upsert_bumps_version() {
    let (store, _pool) = postgres_store().await;

    let function = store
        .upsert_function(sample_function("report"))
        .await
        .unwrap();
    assert_eq!(function.version, 1);

    let mut updated = sample_function("report");
    updated.code = "export function handler() { return 2; }".to_string();
    let updated = store.upsert_function(updated).await.unwrap();
    assert_eq!(updated.id, function.id);
    assert_eq!(updated.version, 2);
    assert!(updated.code.contains("return 2"));
}

#[tokio::test]
async fn deleting_a_function_cascades_files_and_freezes_instances() {
    let (store, _pool) = postgres_store().await;

    let function = store
        .create_function(sample_function("doomed"))
        .await
        .unwrap();
    store
        .upsert_function_file(fluxbase_core::kernel::jobs::FunctionFile::new(
            function.id,
            "lib/util.ts",
            "export const x = 1;",
        ))
        .await
        .unwrap();

    let mut job = sample_job("doomed");
    job.function_id = Some(function.id);
    let job = store.enqueue_job(job).await.unwrap();

    assert!(store.delete_function(function.id).await.unwrap());
    assert!(store.get_function(function.id).await.unwrap().is_none());
    assert!(store
        .list_function_files(function.id)
        .await
        .unwrap()
        .is_empty());

    // The instance survives with its frozen name, function link nulled.
    let frozen: Job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(frozen.job_name, "doomed");
    assert!(frozen.function_id.is_none());
}

#[tokio::test]
async fn queue_stats_count_by_status() {
    let (store, _pool) = postgres_store().await;
    let worker = registered_worker(&store).await;

    store.enqueue_job(sample_job("p")).await.unwrap();
    store.enqueue_job(sample_job("r")).await.unwrap();
    store.claim_next_job(worker.id).await.unwrap().unwrap();

    let stats = store.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.workers, 1);
}
