//! Background loops: run starter, run finalizer, and queue/limiter
//! maintenance.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::{orchestrator, PipelineCtx};

/// Claim queued runs and fan them out, one at a time.
pub async fn run_starter(ctx: Arc<PipelineCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(ctx.config.starter_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        loop {
            match ctx.store.claim_queued_run().await {
                Ok(Some(run)) => {
                    info!(run_id = %run.id, "claimed queued run");
                    if let Err(e) = orchestrator::start_run(&ctx, &run).await {
                        error!(run_id = %run.id, error = %e, "run start failed");
                        ctx.store
                            .reject_run(run.id, &format!("start failed: {e}"))
                            .await
                            .ok();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to claim queued run");
                    break;
                }
            }
        }
    }
}

/// Recompute per-domain completion for running runs and finalize the ones
/// whose domains have all settled.
pub async fn run_finalizer(ctx: Arc<PipelineCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(ctx.config.finalizer_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        let started = Instant::now();
        match ctx.store.running_runs().await {
            Ok(runs) => {
                for run in runs {
                    if let Err(e) = orchestrator::finalize_pass(&ctx, &run).await {
                        error!(run_id = %run.id, error = %e, "finalize pass failed");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to list running runs"),
        }
        ctx.metrics
            .finalize_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }
}

/// Queue upkeep (lease reclaim, cancellation, dependency cascade), limiter
/// lease reclaim, and queue-depth gauges.
pub async fn maintenance(ctx: Arc<PipelineCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(ctx.config.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match ctx.queue.maintain().await {
            Ok(report) => {
                if report.leases_reclaimed > 0 || report.cancelled > 0 || report.dependency_failed > 0
                {
                    info!(
                        leases = report.leases_reclaimed,
                        cancelled = report.cancelled,
                        cascaded = report.dependency_failed,
                        "queue maintenance"
                    );
                }
            }
            Err(e) => error!(error = %e, "queue maintenance failed"),
        }
        if let Err(e) = ctx.limiter.reclaim_expired_leases().await {
            error!(error = %e, "limiter lease reclaim failed");
        }
        if let Ok(depths) = ctx.queue.depths().await {
            for depth in depths {
                ctx.metrics
                    .queue_depth
                    .with_label_values(&[&depth.queue])
                    .set(depth.ready + depth.in_flight);
                ctx.metrics
                    .dlq_depth
                    .with_label_values(&[&depth.queue])
                    .set(depth.dead);
            }
        }
    }
}
