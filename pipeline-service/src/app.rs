//! Internal observability surface: queue depths, DLQ inspection and
//! requeue, per-run progress, MX behavior, and worker heartbeats. The
//! public run/search/export API lives elsewhere.

use axum::extract::{Path, Query, State};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderValue, Method, StatusCode,
};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

use crate::{orchestrator, PipelineCtx};

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<PipelineCtx>,
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = state.ctx.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encode error: {e}"));
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

async fn queue_depths(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let depths = state
        .ctx
        .queue
        .depths()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "queues": depths })))
}

#[derive(Deserialize)]
struct DlqParams {
    limit: Option<i64>,
}

async fn dead_letters(
    State(state): State<AppState>,
    Query(params): Query<DlqParams>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let jobs = state
        .ctx
        .queue
        .dead_letters(limit)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "dead": jobs })))
}

async fn requeue_dead(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let requeued = state
        .ctx
        .queue
        .requeue_dead(job_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !requeued {
        return Err((StatusCode::NOT_FOUND, "no such dead job".to_string()));
    }
    Ok(Json(serde_json::json!({ "requeued": job_id })))
}

async fn run_progress(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let run = state
        .ctx
        .store
        .get_run(run_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "no such run".to_string()))?;
    let events = state
        .ctx
        .store
        .run_events(run_id, 50)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({
        "run_id": run.id,
        "status": run.status,
        "error": run.error,
        "progress": run.progress(),
        "started_at": run.started_at,
        "finished_at": run.finished_at,
        "events": events,
    })))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let cancelled = orchestrator::cancel_run(&state.ctx, run_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !cancelled {
        return Err((StatusCode::CONFLICT, "run is not cancellable".to_string()));
    }
    Ok(Json(serde_json::json!({ "cancelled": run_id })))
}

async fn mx_behavior(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let hosts = state
        .ctx
        .store
        .mx_behavior_snapshot(200)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "hosts": hosts })))
}

async fn workers(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let workers = state
        .ctx
        .store
        .worker_heartbeats()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "workers": workers })))
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE]);

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/internal/queues", get(queue_depths))
        .route("/internal/dlq", get(dead_letters))
        .route("/internal/dlq/:job_id/requeue", post(requeue_dead))
        .route("/internal/runs/:run_id/progress", get(run_progress))
        .route("/internal/runs/:run_id/cancel", post(cancel_run))
        .route("/internal/mx_behavior", get(mx_behavior))
        .route("/internal/workers", get(workers))
        .with_state(state)
        .layer(cors)
}
