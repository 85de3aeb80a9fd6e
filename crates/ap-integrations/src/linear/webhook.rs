//! Linear webhook payloads and their mapping onto queue tasks.

use serde::Deserialize;
use serde_json::Value;

use ap_core::types::{Task, TaskPriority, TaskSource};

/// Envelope Linear posts for every webhook event. Only the fields the
/// mapper reads are typed; `data` stays raw because its shape depends on
/// `type`. The signed `webhookTimestamp` is read by the verifier.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub action: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

pub fn parse_payload(body: &[u8]) -> Result<WebhookPayload, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Linear priorities: 0 none, 1 urgent, 2 high, 3 medium, 4 low.
pub fn map_priority(linear: u64) -> TaskPriority {
    match linear {
        1 => TaskPriority::Critical,
        2 => TaskPriority::High,
        4 => TaskPriority::Low,
        _ => TaskPriority::Normal,
    }
}

#[derive(Debug, Clone)]
pub enum WebhookDecision {
    Enqueue(Box<Task>),
    /// Acknowledged without work, with the reason for the log line.
    Ignore(String),
}

#[derive(Debug, Clone)]
pub struct WebhookMapper {
    trigger_label: Option<String>,
    max_attempts: u32,
}

impl WebhookMapper {
    pub fn new(trigger_label: Option<String>, max_attempts: u32) -> Self {
        Self {
            trigger_label: trigger_label
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
            max_attempts,
        }
    }

    pub fn map(&self, payload: &WebhookPayload) -> WebhookDecision {
        if payload.kind != "Issue" {
            return WebhookDecision::Ignore(format!("unsupported type {}", payload.kind));
        }
        if payload.action != "create" && payload.action != "update" {
            return WebhookDecision::Ignore(format!("unsupported action {}", payload.action));
        }

        let data = &payload.data;
        let key = data["id"]
            .as_str()
            .or_else(|| data["identifier"].as_str())
            .filter(|k| !k.is_empty());
        let Some(key) = key else {
            return WebhookDecision::Ignore("issue without id".to_string());
        };

        // Finished issues never need an agent.
        if let Some(state_type) = data["state"]["type"].as_str() {
            if state_type == "completed" || state_type == "canceled" {
                return WebhookDecision::Ignore(format!("issue state is {state_type}"));
            }
        }

        let labels = issue_labels(data);
        if let Some(trigger) = &self.trigger_label {
            if !labels.iter().any(|l| l.eq_ignore_ascii_case(trigger)) {
                return WebhookDecision::Ignore(format!("missing trigger label {trigger}"));
            }
        }

        let title = data["title"].as_str().unwrap_or_default();
        let task = Task::new(key, title)
            .with_description(data["description"].as_str().unwrap_or_default())
            .with_priority(map_priority(data["priority"].as_u64().unwrap_or(0)))
            .with_tags(labels.iter().map(|l| l.to_ascii_lowercase()))
            .with_max_attempts(self.max_attempts)
            .with_source(TaskSource::Webhook);
        WebhookDecision::Enqueue(Box::new(task))
    }
}

/// Label names from either the full `labels` objects or the flat
/// `labelNames` list some events carry.
fn issue_labels(data: &Value) -> Vec<String> {
    if let Some(labels) = data["labels"].as_array() {
        return labels
            .iter()
            .filter_map(|l| l["name"].as_str().map(str::to_string))
            .collect();
    }
    data["labelNames"]
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
