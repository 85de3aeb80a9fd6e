use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Task, TaskSource, TaskStatus};

/// Snapshot of every task the queue knows about. Persisted as one JSON
/// document after each mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    /// Ordered by priority, FIFO among equals.
    #[serde(default)]
    pub pending: Vec<Task>,
    #[serde(default)]
    pub active: HashMap<Uuid, Task>,
    #[serde(default)]
    pub completed: VecDeque<Task>,
    #[serde(default)]
    pub failed: VecDeque<Task>,
    pub last_updated: DateTime<Utc>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            active: HashMap::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            last_updated: Utc::now(),
        }
    }
}

impl QueueState {
    /// Whether a task with this external key is pending or active.
    pub fn contains_key(&self, issue_id: &str) -> bool {
        self.pending.iter().any(|t| t.issue_id == issue_id)
            || self.active.values().any(|t| t.issue_id == issue_id)
    }

    /// Insert before the first pending task of strictly lower priority.
    pub fn insert_by_priority(&mut self, task: Task) {
        let pos = self
            .pending
            .iter()
            .position(|t| task.priority.outranks(t.priority))
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, task);
    }

    /// Put a task that was just taken back at the head of its priority band,
    /// ahead of equals it was already ahead of.
    pub fn restore_pending(&mut self, mut task: Task) {
        task.status = TaskStatus::Pending;
        task.started_at = None;
        let pos = self
            .pending
            .iter()
            .position(|t| !t.priority.outranks(task.priority))
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, task);
    }

    /// Remove the highest-priority pending task that is ready at `now` and
    /// move it into the active map. Tasks whose status cannot become active
    /// (blocked ones) stay where they are.
    pub fn activate_next(&mut self, now: DateTime<Utc>) -> Option<Task> {
        let idx = self
            .pending
            .iter()
            .position(|t| t.status.can_transition_to(&TaskStatus::Active) && t.is_ready(now))?;
        let mut task = self.pending.remove(idx);
        task.status = TaskStatus::Active;
        task.started_at = Some(now);
        task.retry_after = None;
        task.updated_at = now;
        self.active.insert(task.id, task.clone());
        Some(task)
    }

    pub fn take_active(&mut self, id: &Uuid) -> Option<Task> {
        self.active.remove(id)
    }

    /// Move every active task back to the front of pending, in the order
    /// they were started. Returns how many were recovered.
    pub fn recover_active(&mut self) -> usize {
        if self.active.is_empty() {
            return 0;
        }
        let mut recovered: Vec<Task> = self.active.drain().map(|(_, t)| t).collect();
        recovered.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        let count = recovered.len();
        for task in &mut recovered {
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.source = TaskSource::Recovered;
            task.touch();
        }
        recovered.append(&mut self.pending);
        self.pending = recovered;
        count
    }

    pub fn push_completed(&mut self, task: Task, limit: usize) {
        push_capped(&mut self.completed, task, limit);
    }

    pub fn push_failed(&mut self, task: Task, limit: usize) {
        push_capped(&mut self.failed, task, limit);
    }

    /// Every task in the state, optionally restricted to one status.
    pub fn tasks(&self, filter: Option<TaskStatus>) -> Vec<Task> {
        let all = self
            .pending
            .iter()
            .chain(self.active.values())
            .chain(self.completed.iter())
            .chain(self.failed.iter());
        match filter {
            Some(status) => all.filter(|t| t.status == status).cloned().collect(),
            None => all.cloned().collect(),
        }
    }
}

fn push_capped(buf: &mut VecDeque<Task>, task: Task, limit: usize) {
    buf.push_back(task);
    while buf.len() > limit {
        buf.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskPriority;
    use chrono::Duration;

    fn task(key: &str, priority: TaskPriority) -> Task {
        Task::new(key, key).with_priority(priority)
    }

    fn keys(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.issue_id.as_str()).collect()
    }

    #[test]
    fn insert_keeps_fifo_among_equals() {
        let mut state = QueueState::default();
        state.insert_by_priority(task("n1", TaskPriority::Normal));
        state.insert_by_priority(task("h1", TaskPriority::High));
        state.insert_by_priority(task("n2", TaskPriority::Normal));
        state.insert_by_priority(task("h2", TaskPriority::High));
        state.insert_by_priority(task("l1", TaskPriority::Low));
        assert_eq!(keys(&state.pending), ["h1", "h2", "n1", "n2", "l1"]);
    }

    #[test]
    fn activate_skips_tasks_in_backoff() {
        let now = Utc::now();
        let mut state = QueueState::default();
        let mut waiting = task("waiting", TaskPriority::Critical);
        waiting.retry_after = Some(now + Duration::seconds(30));
        state.insert_by_priority(waiting);
        state.insert_by_priority(task("ready", TaskPriority::Low));

        let next = state.activate_next(now).unwrap();
        assert_eq!(next.issue_id, "ready");
        assert_eq!(next.status, TaskStatus::Active);
        assert!(state.active.contains_key(&next.id));
        assert!(state.activate_next(now).is_none());

        let later = state.activate_next(now + Duration::seconds(31)).unwrap();
        assert_eq!(later.issue_id, "waiting");
        assert!(later.retry_after.is_none());
    }

    #[test]
    fn activate_skips_blocked_tasks() {
        let now = Utc::now();
        let mut state = QueueState::default();
        let mut blocked = task("blocked", TaskPriority::Critical);
        blocked.status = TaskStatus::Blocked;
        state.insert_by_priority(blocked);
        state.insert_by_priority(task("open", TaskPriority::Normal));

        assert_eq!(state.activate_next(now).unwrap().issue_id, "open");
        assert!(state.activate_next(now).is_none());
        assert_eq!(keys(&state.pending), ["blocked"]);
    }

    #[test]
    fn restore_respects_priority() {
        let now = Utc::now();
        let mut state = QueueState::default();
        let mut waiting = task("h1", TaskPriority::High);
        waiting.retry_after = Some(now + Duration::seconds(30));
        state.insert_by_priority(waiting);
        state.insert_by_priority(task("n1", TaskPriority::Normal));
        state.insert_by_priority(task("n2", TaskPriority::Normal));

        let taken = state.activate_next(now).unwrap();
        assert_eq!(taken.issue_id, "n1");
        let taken = state.take_active(&taken.id).unwrap();
        state.restore_pending(taken);

        assert_eq!(keys(&state.pending), ["h1", "n1", "n2"]);
        assert_eq!(state.pending[1].status, TaskStatus::Pending);
        assert!(state.pending[1].started_at.is_none());
    }

    #[test]
    fn recover_puts_active_first_in_start_order() {
        let now = Utc::now();
        let mut state = QueueState::default();
        state.insert_by_priority(task("a", TaskPriority::Normal));
        state.insert_by_priority(task("b", TaskPriority::Normal));
        state.activate_next(now).unwrap();
        state.activate_next(now + Duration::seconds(1)).unwrap();
        state.insert_by_priority(task("c", TaskPriority::Critical));

        assert_eq!(state.recover_active(), 2);
        assert!(state.active.is_empty());
        assert_eq!(keys(&state.pending), ["a", "b", "c"]);
        assert!(state.pending[0].started_at.is_none());
        assert_eq!(state.pending[0].status, TaskStatus::Pending);
        assert_eq!(state.pending[0].source, TaskSource::Recovered);
    }

    #[test]
    fn history_is_capped() {
        let mut state = QueueState::default();
        for i in 0..5 {
            state.push_completed(task(&format!("t{i}"), TaskPriority::Normal), 3);
        }
        assert_eq!(state.completed.len(), 3);
        assert_eq!(state.completed[0].issue_id, "t2");
    }

    #[test]
    fn contains_key_checks_pending_and_active() {
        let mut state = QueueState::default();
        state.insert_by_priority(task("a", TaskPriority::Normal));
        assert!(state.contains_key("a"));
        state.activate_next(Utc::now()).unwrap();
        assert!(state.contains_key("a"));
        assert!(!state.contains_key("b"));
    }
}
