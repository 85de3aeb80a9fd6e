use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// Top-level configuration loaded from `~/.auto-pilot/config.toml`.
///
/// **Security**: this struct never stores API keys or secrets. It only names
/// the environment variables that hold them; see [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub integrations: IntegrationConfig,
}

impl Config {
    /// Load config from `$AUTO_PILOT_CONFIG` or `~/.auto-pilot/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.webhook.validate()?;
        if self.agents.checkpoint_every == 0 {
            return Err(ConfigError::Validation(
                "agents.checkpoint_every must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        if let Ok(p) = std::env::var("AUTO_PILOT_CONFIG") {
            return PathBuf::from(p);
        }
        default_data_dir().join("config.toml")
    }

    /// Directory holding queue state and session records.
    pub fn data_dir(&self) -> PathBuf {
        self.daemon
            .data_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(default_data_dir)
    }

    /// Path of the queue state file.
    pub fn queue_state_path(&self) -> PathBuf {
        self.queue
            .state_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.data_dir().join("queue-state.json"))
    }

    /// Directory of per-task session records.
    pub fn sessions_dir(&self) -> PathBuf {
        self.agents
            .sessions_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.data_dir().join("sessions"))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".auto-pilot")
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_project_name() -> String {
    "auto-pilot".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pending-list capacity; enqueue beyond it is rejected.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Default attempt ceiling for new tasks.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Size of the completed/failed ring buffers.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Sleep between checks while paused.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sleep when no task is ready.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Queue state file. Defaults to `<data_dir>/queue-state.json`.
    #[serde(default)]
    pub state_file: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_pending: default_max_pending(),
            max_attempts: default_max_attempts(),
            history_limit: default_history_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_ms: default_retry_max_ms(),
            state_file: None,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.retry_base_ms),
            multiplier: self.retry_multiplier,
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Validation("queue.workers must be at least 1".into()));
        }
        if self.max_pending == 0 {
            return Err(ConfigError::Validation(
                "queue.max_pending must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "queue.max_attempts must be at least 1".into(),
            ));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "queue.retry_multiplier must be a finite number >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    2
}
fn default_max_pending() -> usize {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_history_limit() -> usize {
    100
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_idle_interval_ms() -> u64 {
    1000
}
fn default_retry_base_ms() -> u64 {
    5_000
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_retry_max_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Env var holding the shared HMAC secret.
    #[serde(default = "default_webhook_secret_env")]
    pub secret_env: String,
    /// Freshness window in either direction.
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default = "default_timestamp_header")]
    pub timestamp_header: String,
    /// Skip all verification. Local testing only; logged on every request.
    #[serde(default)]
    pub dev_bypass: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret_env: default_webhook_secret_env(),
            tolerance_secs: default_tolerance_secs(),
            signature_header: default_signature_header(),
            timestamp_header: default_timestamp_header(),
            dev_bypass: false,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl WebhookConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::from_secs(self.tolerance_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tolerance_secs == 0 {
            return Err(ConfigError::Validation(
                "webhook.tolerance_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_webhook_secret_env() -> String {
    "LINEAR_WEBHOOK_SECRET".into()
}
fn default_tolerance_secs() -> u64 {
    300
}
fn default_signature_header() -> String {
    "linear-signature".into()
}
fn default_timestamp_header() -> String {
    "linear-timestamp".into()
}
fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_claude_cli_path")]
    pub claude_cli_path: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Working directory the engine runs in.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Session records directory. Defaults to `<data_dir>/sessions`.
    #[serde(default)]
    pub sessions_dir: Option<String>,
    /// Flush the session record every N tool calls.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
    /// Summary length posted back to the tracker.
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    /// Per-session wall-clock limit. None = unlimited.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_started_state")]
    pub started_state: String,
    #[serde(default = "default_completed_state")]
    pub completed_state: String,
    /// Extra CLI flags passed through to the engine.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Session records idle longer than this are deleted. 0 keeps them forever.
    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: u64,
}

impl AgentsConfig {
    pub fn session_retention(&self) -> Option<chrono::Duration> {
        match self.session_retention_days {
            0 => None,
            days => i64::try_from(days).ok().map(chrono::Duration::days),
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            claude_cli_path: default_claude_cli_path(),
            model: None,
            workdir: None,
            sessions_dir: None,
            checkpoint_every: default_checkpoint_every(),
            summary_max_chars: default_summary_max_chars(),
            timeout_secs: None,
            started_state: default_started_state(),
            completed_state: default_completed_state(),
            extra_args: Vec::new(),
            session_retention_days: default_session_retention_days(),
        }
    }
}

fn default_claude_cli_path() -> String {
    "claude".into()
}
fn default_checkpoint_every() -> u64 {
    5
}
fn default_summary_max_chars() -> usize {
    1500
}
fn default_started_state() -> String {
    "In Progress".into()
}
fn default_completed_state() -> String {
    "In Review".into()
}
fn default_session_retention_days() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    9480
}

/// Integration settings. Credentials are resolved at runtime via
/// [`CredentialProvider`]; config only stores env var names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Env var name for the Linear API key (default: `LINEAR_API_KEY`).
    #[serde(default = "default_linear_env")]
    pub linear_api_key_env: String,
    /// Linear team ID to scope state lookups.
    #[serde(default)]
    pub linear_team_id: Option<String>,
    /// Only issues carrying this label are enqueued from webhooks.
    #[serde(default)]
    pub trigger_label: Option<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            linear_api_key_env: default_linear_env(),
            linear_team_id: None,
            trigger_label: None,
        }
    }
}

fn default_linear_env() -> String {
    "LINEAR_API_KEY".into()
}

// ---------------------------------------------------------------------------
// CredentialProvider
// ---------------------------------------------------------------------------

/// Reads secrets from environment variables at runtime.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Management API key from `AUTO_PILOT_API_KEY`. `None` = dev mode.
    pub fn daemon_api_key() -> Option<String> {
        Self::non_empty_env("AUTO_PILOT_API_KEY")
    }

    /// Shared webhook secret from the env var named in config.
    pub fn webhook_secret(config: &WebhookConfig) -> Option<String> {
        Self::non_empty_env(&config.secret_env)
    }

    /// Linear API key from the env var named in config.
    pub fn linear_api_key(config: &IntegrationConfig) -> Option<String> {
        Self::non_empty_env(&config.linear_api_key_env)
    }

    fn non_empty_env(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
