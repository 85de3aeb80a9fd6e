//! Runs one queued task as a resumable engine session.
//!
//! ```text
//! handle(task)
//!   load SessionRecord for task.issue_id
//!   NoSession ──open──▶ Active ──stream──▶ completed | failed
//!   Resuming ──resume──▶ Active
//!       └── session expired ──▶ NoSession (fresh session, same record)
//! ```
//!
//! The record is flushed when the engine confirms a session handle, every
//! `checkpoint_every` tool calls, and at the end.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use ap_core::config::AgentsConfig;
use ap_core::queue::{TaskHandler, TaskOutcome};
use ap_core::session_store::SessionStore;
use ap_core::task_error::{ErrorKind, TaskError};
use ap_core::tracker::IssueTracker;
use ap_core::types::{SessionRecord, SessionStatus, Task, TranscriptEntry, TranscriptRole};

use crate::engine::{EngineError, EngineMessage, ReasoningEngine, SessionRequest};
use crate::prompts::PromptSet;
use crate::tool_index::ToolCallIndex;
use crate::transcript::{looks_like_error, normalize_tool_content, truncate_summary};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Flush the record every N tool calls.
    pub checkpoint_every: u64,
    pub summary_max_chars: usize,
    /// Tracker state to move the issue to when work starts.
    pub started_state: Option<String>,
    /// Tracker state to move the issue to on success.
    pub completed_state: Option<String>,
    pub model: Option<String>,
    pub workdir: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&AgentsConfig::default())
    }
}

impl From<&AgentsConfig> for OrchestratorSettings {
    fn from(config: &AgentsConfig) -> Self {
        let non_empty = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        Self {
            checkpoint_every: config.checkpoint_every.max(1),
            summary_max_chars: config.summary_max_chars,
            started_state: non_empty(&config.started_state),
            completed_state: non_empty(&config.completed_state),
            model: config.model.clone(),
            workdir: config.workdir.as_deref().map(ap_core::config::expand_home),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionPhase
// ---------------------------------------------------------------------------

/// Where a task's conversation stands during one `handle` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// No usable handle; the next step opens a fresh session.
    NoSession,
    /// A stored handle is being resumed.
    Resuming { session_id: String },
    /// The engine confirmed the handle in this run.
    Active { session_id: String },
}

impl SessionPhase {
    fn for_record(record: &SessionRecord) -> Self {
        if record.is_resumable() {
            SessionPhase::Resuming {
                session_id: record.session_id.clone(),
            }
        } else {
            SessionPhase::NoSession
        }
    }
}

// ---------------------------------------------------------------------------
// SessionOrchestrator
// ---------------------------------------------------------------------------

pub struct SessionOrchestrator {
    engine: Arc<dyn ReasoningEngine>,
    tracker: Arc<dyn IssueTracker>,
    store: SessionStore,
    prompts: PromptSet,
    settings: OrchestratorSettings,
    tool_index: ToolCallIndex,
}

impl SessionOrchestrator {
    pub fn new(
        engine: Arc<dyn ReasoningEngine>,
        tracker: Arc<dyn IssueTracker>,
        store: SessionStore,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            engine,
            tracker,
            store,
            prompts: PromptSet::default(),
            settings,
            tool_index: ToolCallIndex::new(),
        }
    }

    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn tool_index(&self) -> &ToolCallIndex {
        &self.tool_index
    }

    /// Drive the session to a terminal state, resuming or creating as
    /// needed.
    async fn drive(
        &self,
        task: &Task,
        record: &mut SessionRecord,
    ) -> Result<Option<String>, EngineError> {
        let mut phase = SessionPhase::for_record(record);
        let tags = self.effective_tags(task).await;
        let system = self.prompts.system_prompt(&tags);
        loop {
            match phase.clone() {
                SessionPhase::Resuming { session_id } => {
                    info!(%session_id, "resuming engine session");
                    let prompt = self.prompts.continuation_prompt(task);
                    record.push(TranscriptEntry::new(TranscriptRole::User, prompt.clone()));
                    let request = self.request(system.clone(), prompt, Some(session_id.clone()));
                    match self.run(task, record, request, &mut phase).await {
                        Err(e) if e.kind() == ErrorKind::SessionExpired => {
                            info!(%session_id, error = %e, "stored session expired, starting a new one");
                            record.reset_for_new_session();
                            self.flush(record);
                            phase = SessionPhase::NoSession;
                        }
                        other => return other,
                    }
                }
                SessionPhase::NoSession => {
                    if record.status != SessionStatus::Active {
                        record.reset_for_new_session();
                    }
                    let prompt = self.prompts.task_prompt(task, &tags);
                    record.push(TranscriptEntry::new(TranscriptRole::User, prompt.clone()));
                    let request = self.request(system.clone(), prompt, None);
                    return self.run(task, record, request, &mut phase).await;
                }
                SessionPhase::Active { .. } => {
                    // `run` returns before leaving a phase in Active.
                    return Ok(record.summary.clone());
                }
            }
        }
    }

    fn request(&self, system_prompt: String, prompt: String, resume: Option<String>) -> SessionRequest {
        SessionRequest {
            system_prompt,
            prompt,
            resume,
            model: self.settings.model.clone(),
            workdir: self.settings.workdir.clone(),
        }
    }

    /// Task tags plus whatever labels the tracker currently shows.
    async fn effective_tags(&self, task: &Task) -> BTreeSet<String> {
        let mut tags = task.tags.clone();
        match self.tracker.issue_labels(&task.issue_id).await {
            Ok(labels) => tags.extend(labels.into_iter().map(|l| l.to_lowercase())),
            Err(e) => debug!(error = %e, "could not fetch issue labels, using task tags"),
        }
        tags
    }

    /// Open one engine session and consume its stream.
    async fn run(
        &self,
        task: &Task,
        record: &mut SessionRecord,
        request: SessionRequest,
        phase: &mut SessionPhase,
    ) -> Result<Option<String>, EngineError> {
        let stream = self.engine.open(request).await?;
        let scope = task.issue_id.as_str();
        let mut summary = None;

        while let Ok(item) = stream.recv_async().await {
            match item? {
                EngineMessage::SessionInit { session_id } => {
                    self.capture_session(record, phase, session_id);
                }
                EngineMessage::AssistantText { text } => {
                    record.push(TranscriptEntry::new(TranscriptRole::Assistant, text));
                }
                EngineMessage::ToolUse { id, name, input } => {
                    record.tool_call_count += 1;
                    self.tool_index.record(scope, &id, &name);
                    let mut entry = TranscriptEntry::new(TranscriptRole::ToolUse, name.clone());
                    entry.tool_name = Some(name);
                    entry.tool_input = Some(input);
                    record.push(entry);
                    if record.tool_call_count % self.settings.checkpoint_every == 0 {
                        debug!(tool_calls = record.tool_call_count, "checkpointing session record");
                        self.flush(record);
                    }
                }
                EngineMessage::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let tool_name = self.tool_index.lookup(scope, &tool_use_id);
                    let text = normalize_tool_content(Some(&content));
                    let is_error = is_error || looks_like_error(&text);
                    if is_error {
                        debug!(
                            tool = tool_name.as_deref().unwrap_or("unknown"),
                            %tool_use_id,
                            "tool reported an error"
                        );
                    }
                    let mut entry = TranscriptEntry::new(TranscriptRole::ToolResult, text);
                    entry.tool_name = tool_name;
                    entry.is_error = is_error;
                    record.push(entry);
                }
                EngineMessage::Result {
                    summary: text,
                    is_error,
                    session_id,
                } => {
                    if let Some(id) = session_id {
                        self.capture_session(record, phase, id);
                    }
                    if is_error {
                        return Err(EngineError::Stream(
                            text.unwrap_or_else(|| "engine reported an error".into()),
                        ));
                    }
                    summary = text;
                }
                EngineMessage::Unknown { kind, .. } => {
                    debug!(%kind, "ignoring unknown engine message");
                }
            }
        }
        Ok(summary)
    }

    fn capture_session(&self, record: &mut SessionRecord, phase: &mut SessionPhase, session_id: String) {
        if session_id.is_empty() || record.session_id == session_id {
            *phase = SessionPhase::Active { session_id };
            return;
        }
        info!(%session_id, "engine session established");
        record.session_id = session_id.clone();
        *phase = SessionPhase::Active { session_id };
        self.flush(record);
    }

    fn flush(&self, record: &SessionRecord) {
        if let Err(e) = self.store.save(record) {
            warn!(issue_id = %record.issue_id, error = %e, "failed to save session record");
        }
    }

    async fn notify_started(&self, task: &Task, resuming: bool) {
        let attempt = task.attempts + 1;
        let body = if resuming {
            format!("auto-pilot resumed work on this issue (attempt {attempt} of {}).", task.max_attempts)
        } else {
            format!("auto-pilot started work on this issue (attempt {attempt} of {}).", task.max_attempts)
        };
        if let Err(e) = self.tracker.create_comment(&task.issue_id, &body).await {
            warn!(error = %e, "failed to post start comment");
        }
        if let Some(state) = &self.settings.started_state {
            if let Err(e) = self.tracker.transition_to_state(&task.issue_id, state).await {
                warn!(error = %e, state = %state, "failed to move issue to started state");
            }
        }
    }

    async fn notify_finished(&self, task: &Task, summary: Option<&str>) {
        let summary = summary
            .map(|s| truncate_summary(s, self.settings.summary_max_chars))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "No summary was produced.".to_string());
        let body = format!("auto-pilot finished this issue.\n\n{summary}");
        if let Err(e) = self.tracker.create_comment(&task.issue_id, &body).await {
            warn!(error = %e, "failed to post completion comment");
        }
        if let Some(state) = &self.settings.completed_state {
            if let Err(e) = self.tracker.transition_to_state(&task.issue_id, state).await {
                warn!(error = %e, state = %state, "failed to move issue to completed state");
            }
        }
    }

    async fn notify_failed(&self, task: &Task, error: &EngineError) {
        let body = format!(
            "auto-pilot failed on attempt {} of {}: {error}",
            task.attempts + 1,
            task.max_attempts
        );
        if let Err(e) = self.tracker.create_comment(&task.issue_id, &body).await {
            warn!(error = %e, "failed to post failure comment");
        }
    }
}

#[async_trait]
impl TaskHandler for SessionOrchestrator {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        let mut record = match self.store.load(&task.issue_id) {
            Ok(Some(record)) => record,
            Ok(None) => SessionRecord::new(task.issue_id.clone()),
            Err(e) => {
                warn!(error = %e, "unreadable session record, starting fresh");
                SessionRecord::new(task.issue_id.clone())
            }
        };

        self.notify_started(task, record.is_resumable()).await;
        let result = self.drive(task, &mut record).await;
        let cleared = self.tool_index.clear(&task.issue_id);
        debug!(cleared, "tool index cleared");

        match result {
            Ok(summary) => {
                record.status = SessionStatus::Completed;
                record.summary = summary.clone();
                record.error = None;
                self.flush(&record);
                info!(
                    session_id = %record.session_id,
                    tool_calls = record.tool_call_count,
                    "session completed"
                );
                self.notify_finished(task, summary.as_deref()).await;
                Ok(TaskOutcome {
                    session_id: (!record.session_id.is_empty()).then(|| record.session_id.clone()),
                    summary,
                })
            }
            Err(e) => {
                record.status = SessionStatus::Failed;
                record.error = Some(e.to_string());
                self.flush(&record);
                warn!(session_id = %record.session_id, error = %e, "session failed");
                self.notify_failed(task, &e).await;
                Err(TaskError::new(e.kind(), e.to_string()).with_session(record.session_id.clone()))
            }
        }
    }
}
