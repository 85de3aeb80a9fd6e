use std::sync::Arc;

use ap_core::config::WebhookConfig;
use ap_core::queue::TaskQueue;
use ap_integrations::linear::webhook::WebhookMapper;

use crate::webhook::WebhookVerifier;

/// Shared state for all handlers.
pub struct ApiState {
    pub queue: Arc<TaskQueue>,
    pub verifier: Arc<WebhookVerifier>,
    pub mapper: WebhookMapper,
    /// Header carrying the hex HMAC signature.
    pub signature_header: String,
    pub timestamp_header: String,
}

impl ApiState {
    pub fn new(queue: Arc<TaskQueue>, verifier: Arc<WebhookVerifier>, mapper: WebhookMapper) -> Self {
        let defaults = WebhookConfig::default();
        Self {
            queue,
            verifier,
            mapper,
            signature_header: defaults.signature_header,
            timestamp_header: defaults.timestamp_header,
        }
    }

    pub fn with_headers(mut self, config: &WebhookConfig) -> Self {
        self.signature_header = config.signature_header.clone();
        self.timestamp_header = config.timestamp_header.clone();
        self
    }
}
