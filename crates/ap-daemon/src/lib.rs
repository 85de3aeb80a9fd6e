//! Long-running service: webhook intake, task queue workers and the
//! session orchestrator, wired from one config.

pub mod daemon;
pub mod shutdown;
