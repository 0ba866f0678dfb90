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

use common_observability::VerifierMetrics;
use common_queue::JobQueue;
use common_ratelimit::RateLimiter;
use common_store::Store;

use verifier_service::behavior::PgBehaviorSink;
use verifier_service::config::VerifierConfig;
use verifier_service::fallback::FallbackClient;
use verifier_service::mx::MxResolver;
use verifier_service::smtp::{SmtpIdentity, SmtpProber, SmtpTimeouts};
use verifier_service::{worker, VerifierCtx};

#[derive(Clone)]
struct AppState {
    metrics: VerifierMetrics,
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

    let config = match VerifierConfig::from_env() {
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

    let resolver = MxResolver::new(config.dns_timeout, config.mx_cache_ttl, &config.freemail_denylist_extra);
    let behavior = Arc::new(PgBehaviorSink::new(store.clone()));
    let prober = match SmtpProber::new(
        SmtpIdentity {
            helo_domain: config.smtp_helo_domain.clone(),
            mail_from: config.smtp_mail_from.clone(),
        },
        SmtpTimeouts {
            preflight: config.smtp_preflight_timeout,
            connect: config.smtp_connect_timeout,
            command: config.smtp_command_timeout,
        },
        config.smtp_port,
        behavior,
    ) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to build SMTP prober");
            exit(2);
        }
    };

    let fallback = match &config.third_party_verify_url {
        Some(url) => match FallbackClient::new(url.clone(), config.third_party_verify_api_key.clone()) {
            Ok(client) => Some(client),
            Err(e) => {
                error!(error = %e, "failed to build fallback client");
                exit(2);
            }
        },
        None => None,
    };

    let metrics_bundle = VerifierMetrics::new();
    let ctx = Arc::new(VerifierCtx {
        store,
        queue,
        limiter,
        resolver,
        prober,
        fallback,
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
    info!(%addr, workers = config.worker_count, probes_enabled = config.smtp_probes_enabled, "starting verifier-service");
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
