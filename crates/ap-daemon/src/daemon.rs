use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use ap_agents::claude_cli::ClaudeCliEngine;
use ap_agents::engine::ReasoningEngine;
use ap_agents::orchestrator::{OrchestratorSettings, SessionOrchestrator};
use ap_bridge::http_api::{api_router_with_auth, ApiState};
use ap_bridge::webhook::WebhookVerifier;
use ap_core::config::{Config, CredentialProvider};
use ap_core::queue::TaskQueue;
use ap_core::session_store::SessionStore;
use ap_core::tracker::{IssueTracker, NoopTracker};
use ap_core::types::SessionStatus;
use ap_integrations::linear::webhook::WebhookMapper;
use ap_integrations::linear::LinearClient;

use crate::shutdown::ShutdownSignal;

/// How often expired session records are pruned.
const SESSION_CLEANUP_EVERY: Duration = Duration::from_secs(60 * 60);

/// The auto-pilot service.
///
/// Owns the task queue, the orchestrator driving it and the HTTP API that
/// feeds it. Stops when its [`ShutdownSignal`] fires, letting in-flight
/// tasks finish first.
pub struct Daemon {
    config: Config,
    queue: Arc<TaskQueue>,
    verifier: Arc<WebhookVerifier>,
    sessions: SessionStore,
    api_state: Arc<ApiState>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build the daemon with the Claude CLI engine and, when a Linear API key
    /// is configured, the Linear tracker.
    pub async fn new(config: Config) -> Result<Self> {
        let engine: Arc<dyn ReasoningEngine> = Arc::new(ClaudeCliEngine::from_config(&config.agents));
        let tracker = build_tracker(&config)?;
        Self::with_components(config, engine, tracker).await
    }

    /// Build the daemon around an explicit engine and tracker.
    pub async fn with_components(
        config: Config,
        engine: Arc<dyn ReasoningEngine>,
        tracker: Arc<dyn IssueTracker>,
    ) -> Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let state_path = config.queue_state_path();
        let queue = TaskQueue::open(&state_path, config.queue.clone())
            .with_context(|| format!("failed to open queue state {}", state_path.display()))?;
        let queue = Arc::new(queue);

        let sessions = SessionStore::new(config.sessions_dir());
        match sessions.list() {
            Ok(records) => {
                let resumable = records
                    .iter()
                    .filter(|r| r.status == SessionStatus::Active)
                    .count();
                info!(records = records.len(), resumable, "session records loaded");
            }
            Err(e) => warn!(error = %e, "could not read session records"),
        }

        let orchestrator = SessionOrchestrator::new(
            engine,
            tracker,
            sessions.clone(),
            OrchestratorSettings::from(&config.agents),
        );
        queue.set_handler(Arc::new(orchestrator)).await;

        let verifier = Arc::new(WebhookVerifier::from_config(
            &config.webhook,
            CredentialProvider::webhook_secret(&config.webhook),
        ));
        let mapper = WebhookMapper::new(
            config.integrations.trigger_label.clone(),
            config.queue.max_attempts,
        );
        let api_state = Arc::new(
            ApiState::new(Arc::clone(&queue), Arc::clone(&verifier), mapper)
                .with_headers(&config.webhook),
        );

        Ok(Self {
            config,
            queue,
            verifier,
            sessions,
            api_state,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Handle for triggering shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Bind `daemon.host:daemon.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on a pre-bound listener (tests bind port 0) until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("listener has no local address")?;

        self.queue
            .start(self.config.queue.workers)
            .await
            .context("failed to start task queue")?;

        let sweep_handle = tokio::spawn(sweep_loop(
            Arc::clone(&self.verifier),
            Duration::from_secs(self.config.webhook.sweep_interval_secs.max(1)),
            self.shutdown.clone(),
        ));
        let cleanup_handle = self.config.agents.session_retention().map(|retention| {
            tokio::spawn(session_cleanup_loop(
                self.sessions.clone(),
                retention,
                SESSION_CLEANUP_EVERY,
                self.shutdown.clone(),
            ))
        });

        let api_key = CredentialProvider::daemon_api_key();
        if api_key.is_none() {
            warn!("AUTO_PILOT_API_KEY not set, management API is unauthenticated");
        }
        let router = api_router_with_auth(Arc::clone(&self.api_state), api_key);

        info!(%addr, workers = self.config.queue.workers, "API server listening");
        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await;
        if let Err(e) = &served {
            error!(error = %e, "API server error");
            self.shutdown.trigger();
        }

        info!("draining task queue");
        self.queue
            .shutdown_gracefully()
            .await
            .context("failed to drain task queue")?;
        if let Err(e) = sweep_handle.await {
            warn!(error = %e, "replay sweep task ended abnormally");
        }
        if let Some(handle) = cleanup_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "session cleanup task ended abnormally");
            }
        }

        info!("daemon stopped");
        served.context("API server failed")
    }
}

/// Linear when an API key is configured, otherwise a tracker that only logs.
pub fn build_tracker(config: &Config) -> Result<Arc<dyn IssueTracker>> {
    match CredentialProvider::linear_api_key(&config.integrations) {
        Some(key) => {
            let client = LinearClient::new(&key)
                .context("invalid Linear API key")?
                .with_team(config.integrations.linear_team_id.clone());
            if client.is_stub_key() {
                warn!("Linear API key looks like a test key, tracker runs in stub mode");
            }
            info!("Linear tracker enabled");
            Ok(Arc::new(client))
        }
        None => {
            info!(
                env = %config.integrations.linear_api_key_env,
                "no Linear API key, tracker updates are logged only"
            );
            Ok(Arc::new(NoopTracker))
        }
    }
}

/// Periodically drop expired replay-cache entries.
async fn sweep_loop(verifier: Arc<WebhookVerifier>, every: Duration, shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                verifier.sweep();
            }
            _ = shutdown.wait() => break,
        }
    }
}

/// Delete session records idle longer than `retention`, once at startup and
/// then every `every`.
async fn session_cleanup_loop(
    sessions: SessionStore,
    retention: chrono::Duration,
    every: Duration,
    shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sessions.cleanup_older_than(retention) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned idle session records"),
                    Err(e) => warn!(error = %e, "session record cleanup failed"),
                }
            }
            _ = shutdown.wait() => break,
        }
    }
}
