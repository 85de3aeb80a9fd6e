use std::collections::HashMap;

use dashmap::DashMap;

/// Maps tool-use ids to tool names so results, which only carry the id,
/// can be attributed.
///
/// Scoped per task key because several workers share one orchestrator.
/// Never persisted: a resumed session only sees results for calls it made
/// in the current turn.
#[derive(Debug, Default)]
pub struct ToolCallIndex {
    scopes: DashMap<String, HashMap<String, String>>,
}

impl ToolCallIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, scope: &str, tool_use_id: &str, tool_name: &str) {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(tool_use_id.to_string(), tool_name.to_string());
    }

    pub fn lookup(&self, scope: &str, tool_use_id: &str) -> Option<String> {
        self.scopes
            .get(scope)
            .and_then(|calls| calls.get(tool_use_id).cloned())
    }

    /// Drop everything recorded for `scope`. Returns how many entries went.
    pub fn clear(&self, scope: &str) -> usize {
        self.scopes
            .remove(scope)
            .map(|(_, calls)| calls.len())
            .unwrap_or(0)
    }

    /// Entries recorded for `scope`.
    pub fn len(&self, scope: &str) -> usize {
        self.scopes.get(scope).map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
