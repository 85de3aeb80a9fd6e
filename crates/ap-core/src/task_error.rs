//! Task-level failure type shared by the queue and its handlers.
//!
//! The queue only needs one bit of information from a failure: may it be
//! retried? Errors raised where the cause is known (engine timeouts, rate
//! limits, upstream 5xx) carry an explicit [`ErrorKind`]. Errors built from a
//! bare message fall back to [`classify_message`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure, timeout, rate limit, 502/503-class response.
    Transient,
    /// Anything else. Terminal after the first occurrence.
    Permanent,
    /// The engine no longer knows the session handle. Recovered by the
    /// orchestrator; only reaches the queue if recreation also fails.
    SessionExpired,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Substrings that mark a failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "econnreset",
    "econnrefused",
    "etimedout",
    "socket hang up",
    "connection reset",
    "connection refused",
    "rate limit",
    "rate_limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "bad gateway",
    "service unavailable",
    "overloaded",
];

const SESSION_EXPIRED_MARKERS: &[&str] = &[
    "no conversation found",
    "session not found",
    "session expired",
];

/// Classify an error message by its wording.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if SESSION_EXPIRED_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::SessionExpired
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

/// Failure returned by a [`TaskHandler`](crate::queue::TaskHandler).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Engine session the failure happened in, when one was established.
    pub session_id: Option<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session_id: None,
        }
    }

    /// Build an error whose kind is inferred from its message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(classify_message(&message), message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        let id = session_id.into();
        if !id.is_empty() {
            self.session_id = Some(id);
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::from_message(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::from_message(message)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
