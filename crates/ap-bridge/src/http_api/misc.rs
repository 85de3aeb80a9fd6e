use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use tracing::info;

use ap_telemetry::metrics::global_metrics;

use super::state::ApiState;

/// GET /health
pub(crate) async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// GET /api/status -- queue counters.
pub(crate) async fn get_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.queue.status().await)
}

/// POST /api/queue/pause -- stop dequeuing; active tasks run to completion.
pub(crate) async fn pause_queue(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.queue.pause();
    info!("queue paused via API");
    Json(state.queue.status().await)
}

/// POST /api/queue/resume
pub(crate) async fn resume_queue(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.queue.resume();
    info!("queue resumed via API");
    Json(state.queue.status().await)
}

/// GET /api/metrics -- Prometheus text format.
pub(crate) async fn get_metrics_prometheus() -> impl IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        global_metrics().export_prometheus(),
    )
}

/// GET /api/metrics/json
pub(crate) async fn get_metrics_json() -> impl IntoResponse {
    Json(global_metrics().export_json())
}
