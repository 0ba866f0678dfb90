use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use common_observability::PipelineMetrics;
use common_queue::JobQueue;
use common_ratelimit::RateLimiter;
use common_store::Store;

use pipeline_service::app::{build_router, AppState};
use pipeline_service::config::PipelineConfig;
use pipeline_service::{sweeps, PipelineCtx};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = match PipelineConfig::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            exit(2);
        }
    };

    let pool = match PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
    {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "database unreachable");
            exit(3);
        }
    };

    let store = Store::new(pool.clone());
    if let Err(e) = store.run_migrations().await {
        error!(error = %e, "database migration failed");
        exit(3);
    }

    let queue = JobQueue::new(pool.clone());
    if let Err(e) = queue.ensure_schema().await {
        error!(error = %e, "queue unreachable");
        exit(4);
    }

    let limiter = RateLimiter::new(pool.clone());
    if let Err(e) = limiter.ensure_schema().await {
        error!(error = %e, "rate limiter storage unreachable");
        exit(3);
    }

    let ctx = Arc::new(PipelineCtx {
        store,
        queue,
        limiter,
        metrics: PipelineMetrics::new(),
        config: config.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = Vec::new();
    loops.push(tokio::spawn(sweeps::run_starter(ctx.clone(), shutdown_rx.clone())));
    loops.push(tokio::spawn(sweeps::run_finalizer(ctx.clone(), shutdown_rx.clone())));
    loops.push(tokio::spawn(sweeps::maintenance(ctx.clone(), shutdown_rx.clone())));

    let app = build_router(AppState { ctx: ctx.clone() });

    let ip: std::net::IpAddr = config.host.parse()?;
    let addr = SocketAddr::from((ip, config.port));
    info!(%addr, "starting pipeline-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            shutdown_tx.send(true).ok();
        })
        .await?;

    for handle in loops {
        handle.await.ok();
    }
    Ok(())
}
