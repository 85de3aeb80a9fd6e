use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskPriority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Numeric rank used for queue ordering (lower = runs first).
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }

    /// Returns `true` when `self` should run strictly before `other`.
    pub fn outranks(self, other: TaskPriority) -> bool {
        self.rank() < other.rank()
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Active)
                | (TaskStatus::Pending, TaskStatus::Blocked)
                | (TaskStatus::Blocked, TaskStatus::Pending)
                | (TaskStatus::Active, TaskStatus::Completed)
                | (TaskStatus::Active, TaskStatus::Failed)
                | (TaskStatus::Active, TaskStatus::Pending)
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "active" => Ok(TaskStatus::Active),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Webhook,
    #[default]
    Api,
    /// Put back into pending by restart recovery.
    Recovered,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// External key (e.g. the tracker's issue id). Deduplication key.
    pub issue_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Earliest time a requeued task may be picked up again.
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: TaskSource,
}

impl Task {
    pub fn new(issue_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            issue_id: issue_id.into(),
            title: title.into(),
            description: String::new(),
            tags: BTreeSet::new(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            session_id: None,
            retry_after: None,
            source: TaskSource::Api,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether the task may be dequeued at `now` (backoff has elapsed).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map_or(true, |at| at <= now)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Session records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
    ToolUse,
    ToolResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl TranscriptEntry {
    pub fn new(role: TranscriptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            timestamp: Utc::now(),
            content: content.into(),
            tool_name: None,
            tool_input: None,
            is_error: false,
        }
    }
}

/// Durable record of one task's conversation with the reasoning engine.
///
/// Keyed by the task's external key, so a retried or recovered task finds the
/// session it started earlier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub issue_id: String,
    /// Engine-issued session handle. Empty until the engine confirms it.
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub tool_call_count: u64,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SessionRecord {
    pub fn new(issue_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            issue_id: issue_id.into(),
            session_id: String::new(),
            status: SessionStatus::Active,
            transcript: Vec::new(),
            created_at: now,
            last_activity_at: now,
            tool_call_count: 0,
            summary: None,
            error: None,
        }
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.last_activity_at = entry.timestamp;
        self.transcript.push(entry);
    }

    /// A record can be resumed when it is still active and holds a handle.
    pub fn is_resumable(&self) -> bool {
        self.status == SessionStatus::Active && !self.session_id.is_empty()
    }

    /// Start a fresh conversation on the same record, keeping the transcript.
    pub fn reset_for_new_session(&mut self) {
        self.session_id.clear();
        self.status = SessionStatus::Active;
        self.error = None;
        self.summary = None;
        self.last_activity_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_critical_first() {
        assert!(TaskPriority::Critical.outranks(TaskPriority::High));
        assert!(TaskPriority::High.outranks(TaskPriority::Normal));
        assert!(TaskPriority::Normal.outranks(TaskPriority::Low));
        assert!(!TaskPriority::Normal.outranks(TaskPriority::Normal));
    }

    #[test]
    fn status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Active));
        assert!(TaskStatus::Active.can_transition_to(&TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Active));
        assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Completed));
        assert!(!TaskStatus::Blocked.can_transition_to(&TaskStatus::Active));
    }

    #[test]
    fn status_from_str_is_case_insensitive() {
        assert_eq!("Failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_builder_defaults() {
        let task = Task::new("ISS-1", "Fix login")
            .with_priority(TaskPriority::High)
            .with_tags(["bug", "backend"]);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(task.tags.contains("bug"));
        assert!(task.is_ready(Utc::now()));
    }

    #[test]
    fn max_attempts_never_zero() {
        let task = Task::new("ISS-1", "t").with_max_attempts(0);
        assert_eq!(task.max_attempts, 1);
    }

    #[test]
    fn task_deserializes_with_missing_optional_fields() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "issue_id": "ISS-9",
            "title": "minimal",
            "max_attempts": 2,
            "created_at": Utc::now(),
            "updated_at": Utc::now(),
        });
        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.tags.is_empty());
    }

    #[test]
    fn session_record_resumable_only_when_active_with_handle() {
        let mut record = SessionRecord::new("ISS-1");
        assert!(!record.is_resumable());
        record.session_id = "sess-1".into();
        assert!(record.is_resumable());
        record.status = SessionStatus::Completed;
        assert!(!record.is_resumable());

        record.reset_for_new_session();
        assert!(record.session_id.is_empty());
        assert_eq!(record.status, SessionStatus::Active);
    }
}
