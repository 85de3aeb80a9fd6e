//! auto-pilot daemon: receives Linear webhooks, queues the work and runs a
//! resumable Claude session per issue.

use anyhow::{Context, Result};
use tracing::{error, info};

use ap_core::config::Config;
use ap_daemon::daemon::Daemon;
use ap_telemetry::logging::{init_logging_with_format, LogFormat};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load config")?;

    init_logging_with_format(
        "ap-daemon",
        &config.general.log_level,
        LogFormat::from_config(&config.general.log_format),
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        project = %config.general.project_name,
        data_dir = %config.data_dir().display(),
        "auto-pilot daemon starting"
    );

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
