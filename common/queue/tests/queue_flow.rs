//! Queue transition tests against a live Postgres. Gated behind the
//! `integration-tests` feature; set DATABASE_URL before running.
#![cfg(feature = "integration-tests")]

use common_queue::{EnqueueOpts, JobQueue};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use uuid::Uuid;

async fn queue() -> JobQueue {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.unwrap();
    let queue = JobQueue::new(pool);
    queue.ensure_schema().await.unwrap();
    queue
}

fn qname(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn reserve_is_fifo_and_complete_settles() {
    let queue = queue().await;
    let q = qname("fifo");
    let first = queue
        .enqueue(&q, &serde_json::json!({"n": 1}), &[], None, None, EnqueueOpts::default())
        .await
        .unwrap();
    let second = queue
        .enqueue(&q, &serde_json::json!({"n": 2}), &[], None, None, EnqueueOpts::default())
        .await
        .unwrap();

    let job = queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(job.id, first);
    assert_eq!(job.attempts, 1);
    assert!(queue.complete(job.id, "w1").await.unwrap());

    let job = queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(job.id, second);
    assert!(queue.complete(job.id, "w1").await.unwrap());

    assert!(queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().is_none());
}

#[tokio::test]
async fn depends_on_gates_reservation() {
    let queue = queue().await;
    let q = qname("deps");
    let upstream = queue
        .enqueue(&q, &serde_json::json!({"stage": "crawl"}), &[], None, None, EnqueueOpts::default())
        .await
        .unwrap();
    let downstream = queue
        .enqueue(
            &q,
            &serde_json::json!({"stage": "generate"}),
            &[upstream],
            None,
            None,
            EnqueueOpts::default(),
        )
        .await
        .unwrap();

    // Only the upstream job is visible while it is unfinished.
    let job = queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(job.id, upstream);
    assert!(queue.reserve(&[&q], "w2", Duration::from_secs(60)).await.unwrap().is_none());

    queue.complete(upstream, "w1").await.unwrap();
    let job = queue.reserve(&[&q], "w2", Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(job.id, downstream);
}

#[tokio::test]
async fn exhausted_attempts_land_in_dlq_and_requeue() {
    let queue = queue().await;
    let q = qname("dlq");
    let id = queue
        .enqueue(
            &q,
            &serde_json::json!({}),
            &[],
            None,
            None,
            EnqueueOpts { max_attempts: Some(1), ..Default::default() },
        )
        .await
        .unwrap();

    let job = queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    queue.fail(&job, "w1", "smtp timeout", true).await.unwrap();

    let dead = queue.dead_letters(10).await.unwrap();
    let entry = dead.iter().find(|d| d.id == id).expect("job should be dead");
    assert_eq!(entry.last_error.as_deref(), Some("smtp timeout"));
    assert!(entry.first_seen.is_some());

    assert!(queue.requeue_dead(id).await.unwrap());
    let job = queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn retryable_failure_is_delayed_by_backoff() {
    let queue = queue().await;
    let q = qname("retry");
    queue
        .enqueue(
            &q,
            &serde_json::json!({}),
            &[],
            None,
            None,
            EnqueueOpts { max_attempts: Some(3), ..Default::default() },
        )
        .await
        .unwrap();

    let job = queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    queue.fail(&job, "w1", "transient", true).await.unwrap();

    // First retry waits ~5s; an immediate reserve sees nothing.
    assert!(queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().is_none());
}

#[tokio::test]
async fn cancelled_group_jobs_are_dead_marked_lazily() {
    let queue = queue().await;
    let q = qname("cancel");
    let run_id = Uuid::new_v4();
    queue
        .enqueue(&q, &serde_json::json!({}), &[], Some(run_id), Some("a.test"), EnqueueOpts::default())
        .await
        .unwrap();

    queue.cancel_group(run_id).await.unwrap();
    assert!(queue.group_cancelled(run_id).await.unwrap());
    queue.maintain().await.unwrap();

    assert!(queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().is_none());
    assert_eq!(queue.open_jobs_in_group(run_id, None).await.unwrap(), 0);
    assert_eq!(queue.dead_jobs_in_group(run_id, None).await.unwrap(), 1);
}

#[tokio::test]
async fn expired_lease_returns_job_to_ready() {
    let queue = queue().await;
    let q = qname("lease");
    let id = queue
        .enqueue(&q, &serde_json::json!({}), &[], None, None, EnqueueOpts::default())
        .await
        .unwrap();

    let job = queue.reserve(&[&q], "w1", Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = queue.maintain().await.unwrap();
    assert!(report.leases_reclaimed >= 1);

    // Another worker picks it up; the dead worker's complete is a no-op.
    let job2 = queue.reserve(&[&q], "w2", Duration::from_secs(60)).await.unwrap().unwrap();
    assert_eq!(job2.id, id);
    assert!(!queue.complete(id, "w1").await.unwrap());
    assert!(queue.complete(id, "w2").await.unwrap());
}

#[tokio::test]
async fn dead_dependency_cascades_to_dependents() {
    let queue = queue().await;
    let q = qname("cascade");
    let run_id = Uuid::new_v4();
    let upstream = queue
        .enqueue(
            &q,
            &serde_json::json!({}),
            &[],
            Some(run_id),
            Some("x.test"),
            EnqueueOpts { max_attempts: Some(1), ..Default::default() },
        )
        .await
        .unwrap();
    queue
        .enqueue(
            &q,
            &serde_json::json!({}),
            &[upstream],
            Some(run_id),
            Some("x.test"),
            EnqueueOpts::default(),
        )
        .await
        .unwrap();

    let job = queue.reserve(&[&q], "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    queue.fail(&job, "w1", "boom", false).await.unwrap();
    queue.maintain().await.unwrap();

    assert_eq!(queue.open_jobs_in_group(run_id, Some("x.test")).await.unwrap(), 0);
    assert_eq!(queue.dead_jobs_in_group(run_id, Some("x.test")).await.unwrap(), 2);
    assert_eq!(queue.failed_group_keys(run_id).await.unwrap(), vec!["x.test".to_string()]);
}
