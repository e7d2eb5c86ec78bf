//! eofd server binary.
//!
//! Loads configuration, routes all notifications to structured logs and
//! runs the server until Ctrl-C.

use eofd::config::Config;
use eofd::{Server, TracingSink};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        policy = ?config.policy,
        sentinel_scope = ?config.sentinel_scope,
        idle_timeout_secs = config.connection.idle_timeout.as_secs(),
        buffer_size = config.connection.buffer_size,
        "Starting eofd server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(
        config.host.clone(),
        config.port,
        config.protocol(),
        Arc::new(TracingSink),
    )
    .with_options(config.server_options())
    .start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    server.shutdown().await;
    Ok(())
}
