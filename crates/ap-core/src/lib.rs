//! Core domain for auto-pilot: tasks, the persistent priority queue and its
//! worker pool, configuration, and the on-disk stores that double as the
//! restart-recovery mechanism.

pub mod backoff;
pub mod config;
pub mod queue;
pub mod session_store;
pub mod state_store;
pub mod task_error;
pub mod tracker;
pub mod types;
