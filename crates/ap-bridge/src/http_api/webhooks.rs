use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use tracing::{debug, info, warn};

use ap_integrations::linear::webhook::{parse_payload, WebhookDecision};

use super::state::ApiState;
use super::tasks::enqueue_response;
use super::types::{EnqueueResponse, EnqueueStatus};
use crate::api_error::ApiError;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /webhooks/linear
///
/// 401 on any verifier rejection (nothing is enqueued), 202 accepted,
/// 200 duplicate or ignored, 503 when the queue is full.
pub(crate) async fn linear_webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let signature = header(&headers, &state.signature_header);
    let timestamp = header(&headers, &state.timestamp_header);
    if let Err(rejection) = state.verifier.verify(&body, signature, timestamp) {
        warn!(reason = rejection.reason(), "rejected webhook");
        return Err(ApiError::Unauthorized(rejection.to_string()));
    }

    let payload = parse_payload(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid webhook payload: {e}")))?;

    let task = match state.mapper.map(&payload) {
        WebhookDecision::Enqueue(task) => task,
        WebhookDecision::Ignore(reason) => {
            debug!(kind = %payload.kind, action = %payload.action, %reason, "webhook ignored");
            let issue_id = payload.data["id"].as_str().unwrap_or_default().to_string();
            return Ok((
                StatusCode::OK,
                Json(EnqueueResponse {
                    status: EnqueueStatus::Ignored,
                    issue_id,
                    task_id: None,
                    reason: Some(reason),
                }),
            ));
        }
    };

    let issue_id = task.issue_id.clone();
    let task_id = task.id;
    let outcome = state.queue.enqueue(*task).await?;
    info!(issue_id = %issue_id, ?outcome, "webhook processed");
    Ok(enqueue_response(&issue_id, task_id, outcome))
}
