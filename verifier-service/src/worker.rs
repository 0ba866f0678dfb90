//! Queue-consumer loop for the generate and verify stages.

use common_queue::{Job, TaskError};
use common_store::jobs::{GenerateEmailsJob, VerifyTask, QUEUE_GENERATE, QUEUE_VERIFY};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::generate::run_generate;
use crate::verify::{run_probe_email, run_verify_domain};
use crate::VerifierCtx;

const QUEUES: &[&str] = &[QUEUE_GENERATE, QUEUE_VERIFY];

pub async fn run_worker(
    ctx: Arc<VerifierCtx>,
    worker_index: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let worker_id = format!(
        "verifier-{}-{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into()),
        worker_index
    );
    info!(%worker_id, "verify worker started");
    let mut registry_tick = tokio::time::Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }
        if registry_tick.elapsed() >= Duration::from_secs(60) {
            ctx.store
                .heartbeat_worker(&worker_id, &QUEUES.join(","))
                .await
                .ok();
            registry_tick = tokio::time::Instant::now();
        }

        let job = match ctx.queue.reserve(QUEUES, &worker_id, ctx.config.queue_lease).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let pause = rand::thread_rng().gen_range(500..1200);
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
    info!(%worker_id, "verify worker stopped");
}

async fn handle_job(ctx: &Arc<VerifierCtx>, worker_id: &str, job: Job) {
    let heartbeat = spawn_heartbeat(ctx.clone(), job.id, worker_id.to_string());
    let result = dispatch(ctx, &job).await;
    heartbeat.abort();

    match result {
        Ok(()) => {
            if let Err(e) = ctx.queue.complete(job.id, worker_id).await {
                error!(job_id = %job.id, error = %e, "failed to complete job");
            }
            ctx.metrics
                .jobs_processed_total
                .with_label_values(&[&job.queue, "ok"])
                .inc();
        }
        Err(task_err) => {
            warn!(
                job_id = %job.id,
                queue = %job.queue,
                error = %task_err,
                retryable = task_err.retryable,
                "job failed"
            );
            if let Err(e) = ctx
                .queue
                .fail(&job, worker_id, &task_err.message, task_err.retryable)
                .await
            {
                error!(job_id = %job.id, error = %e, "failed to record job failure");
            }
            ctx.metrics
                .jobs_processed_total
                .with_label_values(&[&job.queue, if task_err.retryable { "retry" } else { "dead" }])
                .inc();
        }
    }
}

async fn dispatch(ctx: &Arc<VerifierCtx>, job: &Job) -> Result<(), TaskError> {
    match job.queue.as_str() {
        QUEUE_GENERATE => {
            let payload: GenerateEmailsJob = serde_json::from_value(job.payload.clone())
                .map_err(|e| TaskError::fatal(format!("undecodable payload: {e}")))?;
            tokio::time::timeout(ctx.config.stage_job_timeout, run_generate(ctx, &payload))
                .await
                .map_err(|_| TaskError::retryable("job_timeout"))?
                .map(|_| ())
        }
        QUEUE_VERIFY => {
            let payload: VerifyTask = serde_json::from_value(job.payload.clone())
                .map_err(|e| TaskError::fatal(format!("undecodable payload: {e}")))?;
            match payload {
                VerifyTask::VerifyDomain(task) => {
                    tokio::time::timeout(
                        ctx.config.stage_job_timeout,
                        run_verify_domain(ctx, &task),
                    )
                    .await
                    .map_err(|_| TaskError::retryable("job_timeout"))?
                    .map(|_| ())
                }
                VerifyTask::ProbeEmail(task) => {
                    let attempts_left = job.attempts < job.max_attempts;
                    tokio::time::timeout(
                        ctx.config.probe_job_timeout,
                        run_probe_email(ctx, &task, attempts_left),
                    )
                    .await
                    .map_err(|_| TaskError::retryable("job_timeout"))?
                }
            }
        }
        other => Err(TaskError::fatal(format!("unexpected queue {other}"))),
    }
}

fn spawn_heartbeat(
    ctx: Arc<VerifierCtx>,
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
