//! Port to the issue tracker the tasks come from.
//!
//! The orchestrator reports progress through this trait. Every call is
//! best-effort: callers log failures and carry on.

use async_trait::async_trait;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Request(String),
    #[error("issue not found: {0}")]
    IssueNotFound(String),
    #[error("unknown workflow state {state} for issue {issue_id}")]
    UnknownState { issue_id: String, state: String },
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Post a comment on the issue identified by `issue_id`.
    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError>;

    /// Move the issue to the workflow state called `state_name`.
    async fn transition_to_state(&self, issue_id: &str, state_name: &str)
        -> Result<(), TrackerError>;

    /// Label names currently attached to the issue.
    async fn issue_labels(&self, issue_id: &str) -> Result<Vec<String>, TrackerError>;
}

/// Tracker used when no real integration is configured. Logs and succeeds.
#[derive(Debug, Default, Clone)]
pub struct NoopTracker;

#[async_trait]
impl IssueTracker for NoopTracker {
    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError> {
        info!(issue_id, chars = body.len(), "tracker disabled, comment dropped");
        Ok(())
    }

    async fn transition_to_state(
        &self,
        issue_id: &str,
        state_name: &str,
    ) -> Result<(), TrackerError> {
        info!(issue_id, state = state_name, "tracker disabled, transition dropped");
        Ok(())
    }

    async fn issue_labels(&self, _issue_id: &str) -> Result<Vec<String>, TrackerError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_tracker_always_succeeds() {
        let tracker = NoopTracker;
        tracker.create_comment("ENG-1", "hello").await.unwrap();
        tracker.transition_to_state("ENG-1", "Done").await.unwrap();
        assert!(tracker.issue_labels("ENG-1").await.unwrap().is_empty());
    }

    #[test]
    fn error_display() {
        let err = TrackerError::UnknownState {
            issue_id: "ENG-1".into(),
            state: "Shipped".into(),
        };
        assert!(err.to_string().contains("Shipped"));
    }
}
