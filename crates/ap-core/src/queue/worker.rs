use std::any::Any;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use ap_telemetry::metrics::global_metrics;

use super::{TaskOutcome, TaskQueue};
use crate::state_store::StoreError;
use crate::task_error::TaskError;
use crate::types::{Task, TaskStatus};

/// One worker loop. Runs until the queue is shut down.
pub(super) async fn run(queue: Arc<TaskQueue>, worker: usize) {
    info!(worker, "queue worker started");
    while !queue.is_shutting_down() {
        if queue.is_paused() {
            queue.idle(queue.config.poll_interval()).await;
            continue;
        }
        match queue.dequeue().await {
            Ok(Some(task)) => {
                let span = tracing::info_span!(
                    "task",
                    worker,
                    task_id = %task.id,
                    issue_id = %task.issue_id,
                    attempt = task.attempts + 1,
                );
                queue.execute(task).instrument(span).await;
            }
            Ok(None) => queue.idle(queue.config.idle_interval()).await,
            Err(e) => {
                error!(worker, error = %e, "queue worker failed to dequeue");
                queue.idle(queue.config.poll_interval()).await;
            }
        }
    }
    info!(worker, "queue worker stopped");
}

impl TaskQueue {
    /// Move the next ready task into the active map and persist.
    async fn dequeue(&self) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.activate_next(Utc::now()) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&mut state) {
            if let Some(task) = state.take_active(&task.id) {
                state.restore_pending(task);
            }
            return Err(e);
        }
        Ok(Some(task))
    }

    async fn execute(&self, task: Task) {
        let handler = self.handler.read().await.clone();
        let result = match handler {
            Some(handler) => {
                let owned = task.clone();
                // Run on its own task so a panicking handler cannot take the
                // worker down with it.
                match tokio::spawn(async move { handler.handle(&owned).await }).await {
                    Ok(result) => result,
                    Err(join_err) => {
                        let reason = if join_err.is_panic() {
                            panic_message(join_err.into_panic())
                        } else {
                            join_err.to_string()
                        };
                        Err(TaskError::permanent(format!("task handler panicked: {reason}")))
                    }
                }
            }
            None => Err(TaskError::permanent("no task handler registered")),
        };
        self.finish(task.id, result).await;
    }

    /// Record the outcome of an execution: completed, requeued or failed.
    async fn finish(&self, task_id: Uuid, result: Result<TaskOutcome, TaskError>) {
        let mut state = self.state.lock().await;
        let Some(mut task) = state.take_active(&task_id) else {
            warn!(%task_id, "finished task is no longer active");
            return;
        };
        let now = Utc::now();
        task.updated_at = now;
        let metrics = global_metrics();

        match result {
            Ok(outcome) => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                if outcome.session_id.is_some() {
                    task.session_id = outcome.session_id;
                }
                info!(attempts = task.attempts + 1, "task completed");
                state.push_completed(task, self.config.history_limit);
                metrics.increment_counter("tasks_completed_total", &[]);
            }
            Err(err) => {
                task.attempts += 1;
                task.last_error = Some(err.message.clone());
                if err.session_id.is_some() {
                    task.session_id = err.session_id.clone();
                }

                if err.is_retryable() && task.has_attempts_left() {
                    let delay = self.backoff.delay_for(task.attempts);
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                    task.retry_after = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d));
                    warn!(
                        attempts = task.attempts,
                        max_attempts = task.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "task failed, will retry"
                    );
                    state.insert_by_priority(task);
                    metrics.increment_counter("tasks_retried_total", &[]);
                } else {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(now);
                    error!(
                        attempts = task.attempts,
                        kind = ?err.kind,
                        error = %err,
                        "task failed permanently"
                    );
                    state.push_failed(task, self.config.history_limit);
                    metrics.increment_counter("tasks_failed_total", &[]);
                }
            }
        }

        if let Err(e) = self.persist(&mut state) {
            error!(%task_id, error = %e, "failed to persist queue state after task finished");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
