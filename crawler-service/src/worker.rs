//! Queue-consumer loop for the crawl stage.

use common_queue::{Job, TaskError};
use common_store::jobs::{AutodiscoveryJob, QUEUE_CRAWL};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::autodiscovery::run_autodiscovery;
use crate::CrawlerCtx;

pub async fn run_worker(
    ctx: Arc<CrawlerCtx>,
    worker_index: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let worker_id = format!(
        "crawler-{}-{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into()),
        worker_index
    );
    info!(%worker_id, "crawl worker started");
    let mut registry_tick = tokio::time::Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }
        if registry_tick.elapsed() >= Duration::from_secs(60) {
            ctx.store.heartbeat_worker(&worker_id, QUEUE_CRAWL).await.ok();
            registry_tick = tokio::time::Instant::now();
        }

        let job = match ctx.queue.reserve(&[QUEUE_CRAWL], &worker_id, ctx.config.queue_lease).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let pause = rand::thread_rng().gen_range(700..1400);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(pause)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            Err(e) => {
                error!(error = %e, "queue reserve failed");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        handle_job(&ctx, &worker_id, job).await;
    }
    info!(%worker_id, "crawl worker stopped");
}

async fn handle_job(ctx: &Arc<CrawlerCtx>, worker_id: &str, job: Job) {
    let heartbeat = spawn_heartbeat(ctx.clone(), job.id, worker_id.to_string());

    let result = match serde_json::from_value::<AutodiscoveryJob>(job.payload.clone()) {
        Ok(payload) => {
            match tokio::time::timeout(ctx.config.job_timeout, run_autodiscovery(ctx, &payload))
                .await
            {
                Ok(inner) => inner.map(|outcome| {
                    info!(
                        run_id = %payload.run_id,
                        domain = %payload.domain,
                        pages = outcome.pages_stored,
                        people = outcome.people_found,
                        emails = outcome.emails_found,
                        "autodiscovery complete"
                    );
                }),
                Err(_) => Err(TaskError::retryable("job_timeout")),
            }
        }
        Err(e) => Err(TaskError::fatal(format!("undecodable payload: {e}"))),
    };
    heartbeat.abort();

    match result {
        Ok(()) => {
            if let Err(e) = ctx.queue.complete(job.id, worker_id).await {
                error!(job_id = %job.id, error = %e, "failed to complete job");
            }
            ctx.metrics
                .jobs_processed_total
                .with_label_values(&[QUEUE_CRAWL, "ok"])
                .inc();
        }
        Err(task_err) => {
            warn!(job_id = %job.id, error = %task_err, retryable = task_err.retryable, "crawl job failed");
            if let Err(e) = ctx
                .queue
                .fail(&job, worker_id, &task_err.message, task_err.retryable)
                .await
            {
                error!(job_id = %job.id, error = %e, "failed to record job failure");
            }
            ctx.metrics
                .jobs_processed_total
                .with_label_values(&[QUEUE_CRAWL, if task_err.retryable { "retry" } else { "dead" }])
                .inc();
        }
    }
}

fn spawn_heartbeat(
    ctx: Arc<CrawlerCtx>,
    job_id: uuid::Uuid,
    worker_id: String,
) -> tokio::task::JoinHandle<()> {
    let lease = ctx.config.queue_lease;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match ctx.queue.heartbeat(job_id, &worker_id, lease).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%job_id, "lease lost while heartbeating");
                    break;
                }
                Err(e) => {
                    error!(%job_id, error = %e, "heartbeat failed");
                }
            }
        }
    })
}
