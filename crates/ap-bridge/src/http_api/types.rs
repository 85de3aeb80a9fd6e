use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ap_core::queue::EnqueueOutcome;
use ap_core::types::TaskPriority;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub issue_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
}

/// Body returned by both enqueue routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub status: EnqueueStatus,
    pub issue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueStatus {
    Accepted,
    Duplicate,
    Ignored,
}

impl From<EnqueueOutcome> for EnqueueStatus {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Accepted => EnqueueStatus::Accepted,
            EnqueueOutcome::Duplicate => EnqueueStatus::Duplicate,
        }
    }
}
