pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use ap_core::tracker::{IssueTracker, TrackerError};

const LINEAR_GRAPHQL_URL: &str = "https://api.linear.app/graphql";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the Linear GraphQL API.
#[derive(Debug, Error)]
pub enum LinearError {
    /// Linear answered with GraphQL errors or a non-success status.
    #[error("Linear API error: {0}")]
    Api(String),

    #[error("missing Linear API key")]
    MissingApiKey,

    #[error("issue not found: {0}")]
    IssueNotFound(String),

    /// No workflow state with this name exists on the issue's team.
    #[error("no workflow state named {state:?} for issue {issue_id}")]
    StateNotFound { issue_id: String, state: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, LinearError>;

impl From<LinearError> for TrackerError {
    fn from(err: LinearError) -> Self {
        match err {
            LinearError::IssueNotFound(id) => TrackerError::IssueNotFound(id),
            LinearError::StateNotFound { issue_id, state } => {
                TrackerError::UnknownState { issue_id, state }
            }
            other => TrackerError::Request(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearIssue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: u8,
    pub state_name: String,
    pub team_id: String,
    pub labels: Vec<String>,
}

/// One column of a team's workflow ("Todo", "In Progress", ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub name: String,
    /// Linear's category: `backlog`, `unstarted`, `started`, `completed`,
    /// `canceled`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Find a state by name, ignoring case and surrounding whitespace.
pub fn find_state<'a>(states: &'a [WorkflowState], name: &str) -> Option<&'a WorkflowState> {
    let wanted = name.trim();
    states.iter().find(|s| s.name.trim().eq_ignore_ascii_case(wanted))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LinearClient {
    api_key: String,
    /// Team whose workflow states are used when an issue's own team cannot
    /// be determined.
    team_id: Option<String>,
    http: reqwest::Client,
}

impl LinearClient {
    pub fn new(api_key: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LinearError::MissingApiKey);
        }
        Ok(Self {
            api_key: api_key.to_string(),
            team_id: None,
            http: reqwest::Client::new(),
        })
    }

    pub fn with_team(mut self, team_id: Option<String>) -> Self {
        self.team_id = team_id;
        self
    }

    /// `true` for keys that are obviously not real Linear keys (those are
    /// `lin_api_` prefixed and long). Such clients answer from stub data so
    /// local runs and tests never touch the network.
    pub fn is_stub_key(&self) -> bool {
        let k = &self.api_key;
        k.starts_with("tok") || k.starts_with("test") || k.starts_with("stub") || k.len() < 10
    }

    fn stub_issue(issue_id: &str) -> LinearIssue {
        LinearIssue {
            id: issue_id.to_string(),
            identifier: "ENG-1".to_string(),
            title: "Stub Linear issue".to_string(),
            description: Some("Auto-generated stub issue".to_string()),
            priority: 3,
            state_name: "Todo".to_string(),
            team_id: "team-001".to_string(),
            labels: vec!["stub".to_string()],
        }
    }

    fn stub_states() -> Vec<WorkflowState> {
        [
            ("state-backlog", "Backlog", "backlog"),
            ("state-todo", "Todo", "unstarted"),
            ("state-progress", "In Progress", "started"),
            ("state-review", "In Review", "started"),
            ("state-done", "Done", "completed"),
        ]
        .into_iter()
        .map(|(id, name, kind)| WorkflowState {
            id: id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
        })
        .collect()
    }

    // -- helpers ------------------------------------------------------------

    /// POST a GraphQL document and return the `data` object.
    async fn graphql(&self, query: &str, variables: Map<String, Value>) -> Result<Value> {
        let payload = json!({ "query": query, "variables": variables });
        let resp = self
            .http
            .post(LINEAR_GRAPHQL_URL)
            .header("Authorization", self.api_key.as_str())
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        let body: Value = resp.json().await?;

        if let Some(errors) = body.get("errors") {
            return Err(LinearError::Api(format!("{status}: {errors}")));
        }
        if !status.is_success() {
            return Err(LinearError::Api(format!("HTTP {status}")));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    fn parse_issue(n: &Value) -> LinearIssue {
        LinearIssue {
            id: n["id"].as_str().unwrap_or_default().to_string(),
            identifier: n["identifier"].as_str().unwrap_or_default().to_string(),
            title: n["title"].as_str().unwrap_or_default().to_string(),
            description: n["description"].as_str().map(str::to_string),
            priority: n["priority"].as_u64().unwrap_or(0).min(u64::from(u8::MAX)) as u8,
            state_name: n["state"]["name"].as_str().unwrap_or("Unknown").to_string(),
            team_id: n["team"]["id"].as_str().unwrap_or_default().to_string(),
            labels: n["labels"]["nodes"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| l["name"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    // -- public API ---------------------------------------------------------

    /// Fetch one issue by id or identifier (`ENG-123`).
    pub async fn get_issue(&self, issue_id: &str) -> Result<LinearIssue> {
        if self.is_stub_key() {
            return Ok(Self::stub_issue(issue_id));
        }

        let query = r#"query($id: String!) {
            issue(id: $id) {
                id
                identifier
                title
                description
                priority
                state { name }
                team { id }
                labels { nodes { name } }
            }
        }"#;
        let mut variables = Map::new();
        variables.insert("id".into(), Value::String(issue_id.to_string()));

        let data = self.graphql(query, variables).await?;
        let node = &data["issue"];
        if node.is_null() {
            return Err(LinearError::IssueNotFound(issue_id.to_string()));
        }
        Ok(Self::parse_issue(node))
    }

    /// Workflow states of a team.
    pub async fn workflow_states(&self, team_id: &str) -> Result<Vec<WorkflowState>> {
        if self.is_stub_key() {
            return Ok(Self::stub_states());
        }

        let query = r#"query($teamId: String!) {
            team(id: $teamId) {
                states { nodes { id name type } }
            }
        }"#;
        let mut variables = Map::new();
        variables.insert("teamId".into(), Value::String(team_id.to_string()));

        let data = self.graphql(query, variables).await?;
        let nodes = data["team"]["states"]["nodes"].clone();
        if nodes.is_null() {
            return Err(LinearError::Api(format!("missing states for team {team_id}")));
        }
        Ok(serde_json::from_value(nodes)?)
    }

    pub async fn add_comment(&self, issue_id: &str, body: &str) -> Result<()> {
        if self.is_stub_key() {
            debug!(issue_id, chars = body.len(), "stub Linear client, comment not sent");
            return Ok(());
        }

        let query = r#"mutation($issueId: String!, $body: String!) {
            commentCreate(input: { issueId: $issueId, body: $body }) { success }
        }"#;
        let mut variables = Map::new();
        variables.insert("issueId".into(), Value::String(issue_id.to_string()));
        variables.insert("body".into(), Value::String(body.to_string()));

        let data = self.graphql(query, variables).await?;
        if data["commentCreate"]["success"].as_bool() != Some(true) {
            return Err(LinearError::Api(format!("commentCreate failed for {issue_id}")));
        }
        Ok(())
    }

    /// Move an issue to the workflow state called `state_name`, resolved
    /// against the issue's team.
    pub async fn move_issue(&self, issue_id: &str, state_name: &str) -> Result<()> {
        let issue = self.get_issue(issue_id).await?;
        if issue.state_name.eq_ignore_ascii_case(state_name.trim()) {
            debug!(issue_id, state = state_name, "issue already in target state");
            return Ok(());
        }
        let team_id = if issue.team_id.is_empty() {
            self.team_id.clone().ok_or_else(|| {
                LinearError::Api(format!("cannot determine team for issue {issue_id}"))
            })?
        } else {
            issue.team_id.clone()
        };

        let states = self.workflow_states(&team_id).await?;
        let state = find_state(&states, state_name).ok_or_else(|| LinearError::StateNotFound {
            issue_id: issue_id.to_string(),
            state: state_name.to_string(),
        })?;

        if self.is_stub_key() {
            info!(issue_id, state = %state.name, "stub Linear client, transition not sent");
            return Ok(());
        }

        let query = r#"mutation($id: String!, $stateId: String!) {
            issueUpdate(id: $id, input: { stateId: $stateId }) { success }
        }"#;
        let mut variables = Map::new();
        variables.insert("id".into(), Value::String(issue_id.to_string()));
        variables.insert("stateId".into(), Value::String(state.id.clone()));

        let data = self.graphql(query, variables).await?;
        if data["issueUpdate"]["success"].as_bool() != Some(true) {
            return Err(LinearError::Api(format!("issueUpdate failed for {issue_id}")));
        }
        info!(issue_id, state = %state.name, "moved Linear issue");
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for LinearClient {
    async fn create_comment(&self, issue_id: &str, body: &str) -> std::result::Result<(), TrackerError> {
        Ok(self.add_comment(issue_id, body).await?)
    }

    async fn transition_to_state(
        &self,
        issue_id: &str,
        state_name: &str,
    ) -> std::result::Result<(), TrackerError> {
        Ok(self.move_issue(issue_id, state_name).await?)
    }

    async fn issue_labels(&self, issue_id: &str) -> std::result::Result<Vec<String>, TrackerError> {
        Ok(self.get_issue(issue_id).await?.labels)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
