use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use common_observability::CrawlerMetrics;
use common_queue::JobQueue;
use common_ratelimit::RateLimiter;
use common_store::Store;

use crawler_service::config::CrawlerConfig;
use crawler_service::extract::RuleBasedExtractor;
use crawler_service::fetch::Fetcher;
use crawler_service::{worker, CrawlerCtx};

#[derive(Clone)]
struct AppState {
    metrics: CrawlerMetrics,
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encode error: {e}"));
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = match CrawlerConfig::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            exit(2);
        }
    };

    let pool = match PgPoolOptions::new()
        .max_connections((config.worker_count as u32 * 2).max(8))
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

    let metrics_bundle = CrawlerMetrics::new();
    let fetcher = Fetcher::new(limiter.clone(), config.clone())?;
    let ctx = Arc::new(CrawlerCtx {
        store,
        queue,
        limiter,
        fetcher,
        extractor: Arc::new(RuleBasedExtractor::new()),
        metrics: metrics_bundle.clone(),
        config: config.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    for i in 0..config.worker_count {
        workers.push(tokio::spawn(worker::run_worker(ctx.clone(), i, shutdown_rx.clone())));
    }

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .with_state(AppState { metrics: metrics_bundle });

    let ip: std::net::IpAddr = config.host.parse()?;
    let addr = SocketAddr::from((ip, config.port));
    info!(%addr, workers = config.worker_count, "starting crawler-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            shutdown_tx.send(true).ok();
        })
        .await?;

    for handle in workers {
        handle.await.ok();
    }
    Ok(())
}
