use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};

use ap_core::queue::EnqueueOutcome;
use ap_core::types::{Task, TaskSource, TaskStatus};

use super::state::ApiState;
use super::types::{CreateTaskRequest, EnqueueResponse, TaskListQuery};
use crate::api_error::ApiError;

/// POST /api/tasks -- enqueue directly, bypassing the tracker.
///
/// 202 when accepted, 200 when a task with the same key is already queued.
pub(crate) async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let issue_id = req.issue_id.trim();
    if issue_id.is_empty() {
        return Err(ApiError::BadRequest("issue_id must not be empty".into()));
    }
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    let max_attempts = req
        .max_attempts
        .unwrap_or(state.queue.config().max_attempts);
    if max_attempts == 0 {
        return Err(ApiError::BadRequest("max_attempts must be at least 1".into()));
    }

    let task = Task::new(issue_id, req.title.trim())
        .with_description(req.description)
        .with_priority(req.priority.unwrap_or_default())
        .with_tags(req.tags.iter().map(|t| t.trim().to_ascii_lowercase()).filter(|t| !t.is_empty()))
        .with_max_attempts(max_attempts)
        .with_source(TaskSource::Api);
    let task_id = task.id;

    let outcome = state.queue.enqueue(task).await?;
    Ok(enqueue_response(issue_id, task_id, outcome))
}

pub(crate) fn enqueue_response(
    issue_id: &str,
    task_id: uuid::Uuid,
    outcome: EnqueueOutcome,
) -> (StatusCode, Json<EnqueueResponse>) {
    let (code, task_id) = match outcome {
        EnqueueOutcome::Accepted => (StatusCode::ACCEPTED, Some(task_id)),
        EnqueueOutcome::Duplicate => (StatusCode::OK, None),
    };
    (
        code,
        Json(EnqueueResponse {
            status: outcome.into(),
            issue_id: issue_id.to_string(),
            task_id,
            reason: None,
        }),
    )
}

/// GET /api/tasks?status=pending -- tasks in queue order, optionally filtered.
pub(crate) async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let filter = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(TaskStatus::from_str(s).map_err(ApiError::BadRequest)?),
    };
    Ok(Json(state.queue.tasks(filter).await))
}
