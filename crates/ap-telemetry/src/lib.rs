//! Observability plumbing shared by every auto-pilot crate.
//!
//! - **Logging**: `tracing-subscriber` setup, human-readable or JSON
//! - **Metrics**: process-wide counters and gauges with Prometheus export
//! - **Middleware**: axum layers for request ids and request counting

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
