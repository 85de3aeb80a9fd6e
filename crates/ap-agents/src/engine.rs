//! Port to the external reasoning engine.
//!
//! The orchestrator treats the engine as a black box: hand it a
//! [`SessionRequest`], get back a channel of typed [`EngineMessage`]s. The
//! channel closes when the session turn ends.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ap_core::task_error::{classify_message, ErrorKind};

/// Everything needed to open or resume one engine session.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub system_prompt: String,
    pub prompt: String,
    /// Handle of a previous session to continue.
    pub resume: Option<String>,
    pub model: Option<String>,
    pub workdir: Option<PathBuf>,
}

/// One message from the engine's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    /// The engine confirmed the session handle.
    SessionInit { session_id: String },
    AssistantText { text: String },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// Raw payload; any JSON shape.
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Final message of the turn.
    Result {
        summary: Option<String>,
        is_error: bool,
        session_id: Option<String>,
    },
    /// A kind this build does not understand.
    Unknown { kind: String, raw: Value },
}

/// Items on the stream. An `Err` ends the session as failed.
pub type MessageStream = flume::Receiver<Result<EngineMessage, EngineError>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The resume handle is unknown to the engine.
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("failed to start engine: {0}")]
    Spawn(String),
    #[error("engine exited with status {code:?}: {stderr}")]
    Process { code: Option<i32>, stderr: String },
    #[error("engine session timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine stream error: {0}")]
    Stream(String),
}

impl EngineError {
    /// How the queue should treat this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::SessionNotFound(_) => ErrorKind::SessionExpired,
            EngineError::Timeout(_) => ErrorKind::Transient,
            EngineError::Spawn(_) => ErrorKind::Permanent,
            EngineError::Process { stderr, .. } => classify_message(stderr),
            EngineError::Stream(message) => classify_message(message),
        }
    }
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Start (or resume) a session and stream its output.
    async fn open(&self, request: SessionRequest) -> Result<MessageStream, EngineError>;
}
