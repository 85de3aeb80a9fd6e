//! HTTP surface of the daemon: the Linear webhook receiver plus a small
//! management API over the task queue.

mod misc;
pub mod state;
mod tasks;
pub mod types;
mod webhooks;

pub use state::ApiState;
pub use types::*;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use ap_telemetry::middleware::metrics_middleware;
use ap_telemetry::tracing_setup::request_id_middleware;

use crate::auth::AuthLayer;

/// Webhook bodies are small JSON documents.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Router without API-key enforcement.
pub fn api_router(state: Arc<ApiState>) -> Router {
    api_router_with_auth(state, None)
}

/// `/api/*` sits behind [`AuthLayer`]; the webhook route authenticates
/// through the signature verifier and `/health` is open.
pub fn api_router_with_auth(state: Arc<ApiState>, api_key: Option<String>) -> Router {
    let management = Router::new()
        .route("/api/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/api/status", get(misc::get_status))
        .route("/api/queue/pause", post(misc::pause_queue))
        .route("/api/queue/resume", post(misc::resume_queue))
        .route("/api/metrics", get(misc::get_metrics_prometheus))
        .route("/api/metrics/json", get(misc::get_metrics_json))
        .layer(AuthLayer::new(api_key));

    Router::new()
        .route("/health", get(misc::health))
        .route("/webhooks/linear", post(webhooks::linear_webhook))
        .merge(management)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
