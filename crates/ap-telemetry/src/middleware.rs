use axum::{body::Body, extract::Request, middleware::Next, response::Response};

use crate::metrics::global_metrics;

/// Axum middleware counting API requests in `api_requests_total`, labelled
/// by `method` and `status`.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();

    global_metrics().increment_counter(
        "api_requests_total",
        &[("method", &method), ("status", &status)],
    );
    response
}
