//! Persistent priority queue and the worker pool that drains it.
//!
//! All state lives in one [`QueueState`] behind a single async mutex. Each
//! transition (enqueue, dequeue, complete, fail, requeue) takes the lock,
//! mutates, writes the state file, and releases. The lock is never held
//! while a handler runs.

mod state;
mod worker;

pub use state::QueueState;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ap_telemetry::metrics::global_metrics;

use crate::backoff::BackoffPolicy;
use crate::config::QueueConfig;
use crate::state_store::{JsonFile, StoreError};
use crate::task_error::TaskError;
use crate::types::{Task, TaskStatus};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full ({capacity} pending tasks)")]
    QueueFull { capacity: usize },
    #[error("queue state store: {0}")]
    Store(#[from] StoreError),
    #[error("no task handler registered")]
    NoHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Accepted,
    /// A task with the same external key is already pending or active.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub active_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub paused: bool,
    pub uptime_seconds: u64,
}

/// What a handler reports back on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub session_id: Option<String>,
    pub summary: Option<String>,
}

/// Executes one task. Called by queue workers with no queue lock held.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, TaskError>;
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

pub struct TaskQueue {
    state: Mutex<QueueState>,
    store: JsonFile,
    config: QueueConfig,
    backoff: BackoffPolicy,
    paused: AtomicBool,
    shutdown: AtomicBool,
    /// Wakes sleeping workers on shutdown.
    wake: Notify,
    handler: RwLock<Option<Arc<dyn TaskHandler>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl TaskQueue {
    /// Open the queue backed by `state_path`, recovering any state left by a
    /// previous process. Tasks that were active when it stopped go back to
    /// the front of the pending list.
    pub fn open(state_path: impl Into<PathBuf>, config: QueueConfig) -> Result<Self, QueueError> {
        let store = JsonFile::new(state_path);
        let mut state: QueueState = store.load()?.unwrap_or_default();

        let recovered = state.recover_active();
        if recovered > 0 {
            info!(
                recovered,
                path = %store.path().display(),
                "re-queued tasks that were active at last shutdown"
            );
        }
        state.last_updated = Utc::now();
        store.save(&state)?;

        info!(
            pending = state.pending.len(),
            completed = state.completed.len(),
            failed = state.failed.len(),
            "task queue loaded"
        );

        let backoff = config.backoff();
        Ok(Self {
            state: Mutex::new(state),
            store,
            config,
            backoff,
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
            handler: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    /// Override the retry delay policy derived from config.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a task. Rejects with [`QueueError::QueueFull`] at capacity and
    /// returns [`EnqueueOutcome::Duplicate`] if the key is already queued.
    pub async fn enqueue(&self, mut task: Task) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().await;

        if state.pending.len() >= self.config.max_pending {
            warn!(
                issue_id = %task.issue_id,
                capacity = self.config.max_pending,
                "queue full, rejecting task"
            );
            return Err(QueueError::QueueFull {
                capacity: self.config.max_pending,
            });
        }
        if state.contains_key(&task.issue_id) {
            debug!(issue_id = %task.issue_id, "task already queued, ignoring duplicate");
            return Ok(EnqueueOutcome::Duplicate);
        }

        task.status = TaskStatus::Pending;
        task.touch();
        let task_id = task.id;
        let issue_id = task.issue_id.clone();
        let priority = task.priority;
        state.insert_by_priority(task);

        if let Err(e) = self.persist(&mut state) {
            state.pending.retain(|t| t.id != task_id);
            return Err(e.into());
        }

        global_metrics().increment_counter("tasks_enqueued_total", &[]);
        info!(%task_id, %issue_id, ?priority, pending = state.pending.len(), "task enqueued");
        Ok(EnqueueOutcome::Accepted)
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            pending_count: state.pending.len(),
            active_count: state.active.len(),
            completed_count: state.completed.len(),
            failed_count: state.failed.len(),
            paused: self.is_paused(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Snapshot of known tasks, optionally filtered by status.
    pub async fn tasks(&self, filter: Option<TaskStatus>) -> Vec<Task> {
        self.state.lock().await.tasks(filter)
    }

    /// Stop handing out new tasks. Tasks already running finish normally.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("task queue paused");
        }
    }

    pub fn resume(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            warn!("ignoring resume on a queue that is shutting down");
            return;
        }
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("task queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn set_handler(&self, handler: Arc<dyn TaskHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Spawn `workers` worker loops. A handler must be registered first.
    pub async fn start(self: &Arc<Self>, workers: usize) -> Result<(), QueueError> {
        if self.handler.read().await.is_none() {
            return Err(QueueError::NoHandler);
        }
        let mut handles = self.workers.lock().await;
        if !handles.is_empty() {
            warn!(running = handles.len(), "task queue workers already started");
            return Ok(());
        }
        let workers = workers.max(1);
        for id in 0..workers {
            let queue = Arc::clone(self);
            handles.push(tokio::spawn(worker::run(queue, id)));
        }
        info!(workers, "task queue started");
        Ok(())
    }

    /// Stop dequeuing, wait for every worker to finish the task in hand,
    /// then write the state file one last time.
    pub async fn shutdown_gracefully(&self) -> Result<(), QueueError> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        info!(workers = handles.len(), "waiting for queue workers to drain");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "queue worker ended abnormally");
            }
        }

        let mut state = self.state.lock().await;
        self.persist(&mut state)?;
        info!(pending = state.pending.len(), "task queue shut down");
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn persist(&self, state: &mut QueueState) -> Result<(), StoreError> {
        state.last_updated = Utc::now();
        self.store.save(state)?;
        let metrics = global_metrics();
        metrics.set_gauge("queue_pending", state.pending.len() as i64);
        metrics.set_gauge("queue_active", state.active.len() as i64);
        Ok(())
    }

    /// Sleep for `duration`, returning early on shutdown.
    async fn idle(&self, duration: Duration) {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        // Registered before the flag check, so a shutdown landing in between
        // still wakes this sleeper.
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = &mut notified => {}
        }
    }
}
