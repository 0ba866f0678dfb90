//! Orchestrator flow against a live Postgres: fan-out with dependency
//! chains, budget rejection, and finalization accounting. Gated behind
//! the `integration-tests` feature; set DATABASE_URL before running.
#![cfg(feature = "integration-tests")]

use std::sync::Arc;
use std::time::Duration;

use common_observability::PipelineMetrics;
use common_queue::JobQueue;
use common_ratelimit::RateLimiter;
use common_store::jobs::{QUEUE_CRAWL, QUEUE_GENERATE, QUEUE_VERIFY};
use common_store::{RunOptions, Store};
use pipeline_service::config::PipelineConfig;
use pipeline_service::{orchestrator, PipelineCtx};
use uuid::Uuid;

// The stage queues are shared names; run these tests one at a time and
// start each from a drained queue state.
static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn ctx(company_cap: i64) -> (Arc<PipelineCtx>, tokio::sync::MutexGuard<'static, ()>) {
    let guard = SERIAL.lock().await;
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = Store::connect(&url, 4).await.unwrap();
    store.run_migrations().await.unwrap();
    let queue = JobQueue::new(store.pool().clone());
    queue.ensure_schema().await.unwrap();
    let limiter = RateLimiter::new(store.pool().clone());
    limiter.ensure_schema().await.unwrap();
    sqlx::query("DELETE FROM jobs WHERE queue IN ($1, $2, $3)")
        .bind(QUEUE_CRAWL)
        .bind(QUEUE_GENERATE)
        .bind(QUEUE_VERIFY)
        .execute(store.pool())
        .await
        .unwrap();
    let ctx = Arc::new(PipelineCtx {
        store,
        queue,
        limiter,
        metrics: PipelineMetrics::new(),
        config: Arc::new(PipelineConfig {
            database_url: url,
            host: "127.0.0.1".into(),
            port: 0,
            hard_company_limit_24h: company_cap,
            starter_interval: Duration::from_millis(100),
            finalizer_interval: Duration::from_millis(100),
            maintenance_interval: Duration::from_millis(100),
        }),
    });
    (ctx, guard)
}

async fn queued_run(ctx: &PipelineCtx, domains: &[&str], options: RunOptions) -> Uuid {
    let tenant_id = Uuid::new_v4();
    ctx.store.ensure_tenant(tenant_id, "orchestration-test").await.unwrap();
    let list: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
    ctx.store.create_run(tenant_id, &list, &options).await.unwrap()
}

#[tokio::test]
async fn full_mode_chains_stages_through_dependencies() {
    let (ctx, _guard) = ctx(1000).await;
    let run_id = queued_run(&ctx, &["chain-one.test"], RunOptions::default()).await;

    let run = ctx.store.claim_run(run_id).await.unwrap().unwrap();
    orchestrator::start_run(&ctx, &run).await.unwrap();

    // Three open jobs, but only the crawl one is reservable.
    assert_eq!(ctx.queue.open_jobs_in_group(run_id, None).await.unwrap(), 3);
    let worker = "test-worker";
    let crawl = ctx
        .queue
        .reserve(&[QUEUE_CRAWL, QUEUE_GENERATE, QUEUE_VERIFY], worker, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(crawl.queue, QUEUE_CRAWL);
    assert!(ctx
        .queue
        .reserve(&[QUEUE_GENERATE, QUEUE_VERIFY], worker, Duration::from_secs(60))
        .await
        .unwrap()
        .is_none());

    // Completing crawl releases generate, then verify.
    ctx.queue.complete(crawl.id, worker).await.unwrap();
    let generate = ctx
        .queue
        .reserve(&[QUEUE_GENERATE, QUEUE_VERIFY], worker, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(generate.queue, QUEUE_GENERATE);
    ctx.queue.complete(generate.id, worker).await.unwrap();
    let verify = ctx
        .queue
        .reserve(&[QUEUE_VERIFY], worker, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verify.queue, QUEUE_VERIFY);
    ctx.queue.complete(verify.id, worker).await.unwrap();

    // All settled: the finalizer closes the run with full completion.
    let run = ctx.store.get_run(run_id).await.unwrap().unwrap();
    orchestrator::finalize_pass(&ctx, &run).await.unwrap();
    let run = ctx.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "succeeded");
    assert_eq!(run.domains_completed, run.domains_total);
}

#[tokio::test]
async fn finalizer_skips_run_until_fanout_commits() {
    let (ctx, _guard) = ctx(1000).await;
    let run_id = queued_run(&ctx, &["early-tick.test"], RunOptions::default()).await;
    let run = ctx.store.claim_run(run_id).await.unwrap().unwrap();

    // A finalizer tick landing between the claim and the fan-out commit
    // must not touch the run: domains_total is still zero, so there is
    // nothing to count and certainly nothing to finalize.
    orchestrator::finalize_pass(&ctx, &run).await.unwrap();
    let mid = ctx.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(mid.status, "running");
    assert_eq!(mid.domains_total, 0);
    assert_eq!(mid.domains_completed, 0);

    // Once start_run returns, the commit and the jobs exist together; a
    // tick now sees the open chain and keeps the run running.
    orchestrator::start_run(&ctx, &run).await.unwrap();
    let started = ctx.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(started.domains_total, 1);
    assert_eq!(ctx.queue.open_jobs_in_group(run_id, None).await.unwrap(), 3);
    orchestrator::finalize_pass(&ctx, &started).await.unwrap();
    let after = ctx.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(after.status, "running");
    assert_eq!(after.domains_completed, 0);
}

#[tokio::test]
async fn budget_overrun_rejects_the_whole_run() {
    let (ctx, _guard) = ctx(1).await;
    let run_id = queued_run(
        &ctx,
        &["budget-a.test", "budget-b.test"],
        RunOptions::default(),
    )
    .await;

    let run = ctx.store.claim_run(run_id).await.unwrap().unwrap();
    orchestrator::start_run(&ctx, &run).await.unwrap();

    let run = ctx.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error.as_deref(), Some(orchestrator::ERR_COMPANY_LIMIT));
    assert_eq!(ctx.queue.open_jobs_in_group(run_id, None).await.unwrap(), 0);
}

#[tokio::test]
async fn budget_boundary_admits_exactly_the_cap() {
    let (ctx, _guard) = ctx(1).await;
    let run_id = queued_run(&ctx, &["boundary-only.test"], RunOptions::default()).await;
    let run = ctx.store.claim_run(run_id).await.unwrap().unwrap();
    orchestrator::start_run(&ctx, &run).await.unwrap();

    let run = ctx.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "running");
    assert_eq!(run.domains_total, 1);
}

#[tokio::test]
async fn failed_domain_is_isolated_and_counted() {
    let (ctx, _guard) = ctx(1000).await;
    let run_id = queued_run(
        &ctx,
        &["iso-good.test", "iso-bad.test"],
        RunOptions { mode: common_store::RunMode::Autodiscovery, ..Default::default() },
    )
    .await;
    let run = ctx.store.claim_run(run_id).await.unwrap().unwrap();
    orchestrator::start_run(&ctx, &run).await.unwrap();

    let worker = "iso-worker";
    // Two crawl jobs; complete one, dead-letter the other.
    let first = ctx.queue.reserve(&[QUEUE_CRAWL], worker, Duration::from_secs(60)).await.unwrap().unwrap();
    let second = ctx.queue.reserve(&[QUEUE_CRAWL], worker, Duration::from_secs(60)).await.unwrap().unwrap();
    ctx.queue.complete(first.id, worker).await.unwrap();
    ctx.queue.fail(&second, worker, "crawler exploded", false).await.unwrap();
    ctx.queue.maintain().await.unwrap();

    let run = ctx.store.get_run(run_id).await.unwrap().unwrap();
    orchestrator::finalize_pass(&ctx, &run).await.unwrap();
    let run = ctx.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "succeeded", "one healthy domain keeps the run alive");
    assert_eq!(run.domains_completed, 2);
}

#[tokio::test]
async fn cancel_dead_marks_remaining_jobs() {
    let (ctx, _guard) = ctx(1000).await;
    let run_id = queued_run(&ctx, &["cancel-me.test"], RunOptions::default()).await;
    let run = ctx.store.claim_run(run_id).await.unwrap().unwrap();
    orchestrator::start_run(&ctx, &run).await.unwrap();

    assert!(orchestrator::cancel_run(&ctx, run_id).await.unwrap());
    ctx.queue.maintain().await.unwrap();
    assert_eq!(ctx.queue.open_jobs_in_group(run_id, None).await.unwrap(), 0);

    let run = ctx.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "cancelled");
    // Terminal is irreversible: cancelling again is a no-op.
    assert!(!orchestrator::cancel_run(&ctx, run_id).await.unwrap());
}

#[tokio::test]
async fn resubmitting_a_claimed_run_is_a_noop() {
    let (ctx, _guard) = ctx(1000).await;
    let _run_id = queued_run(&ctx, &["noop.test"], RunOptions::default()).await;
    let first = ctx.store.claim_run(_run_id).await.unwrap();
    assert!(first.is_some());
    // The queued->running edge already fired; nothing left to claim.
    let again = ctx.store.claim_run(_run_id).await.unwrap();
    assert!(again.is_none());
}
