//! Sigilkeep Daemon
//!
//! Background service that resolves secret references, watches backends for
//! rotation, manages leases, and exposes a local JSON-RPC API.
//!
//! # Running
//!
//! ```bash
//! cargo run -p sigilkeep-daemon
//! # or after install:
//! sigilkeepd
//! ```

use anyhow::{Context, Result};
use sigilkeep_core::{BackendRegistry, SecretEvent, SecretService};
use sigilkeep_daemon::{ApiState, DaemonConfig, load_config, start_server};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config.log_level);

    info!("Starting Sigilkeep daemon...");
    info!("Loaded configuration from {:?}", config.config_path);

    run_daemon(config).await
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let registry =
        BackendRegistry::from_config(&config.service, &BackendRegistry::default_factories())
            .context("Failed to construct secret backends")?;

    let service = Arc::new(
        SecretService::start(config.service.clone(), registry)
            .context("Failed to start secret service")?,
    );

    service.listen("event-log", |event: SecretEvent| async move {
        match &event {
            SecretEvent::AuthFailed { .. } | SecretEvent::LeaseExpired { .. } => {
                warn!(event = event.event_type(), secret = ?event.secret_name(), "secret event");
            }
            _ => {
                info!(event = event.event_type(), secret = ?event.secret_name(), "secret event");
            }
        }
        Ok::<(), Infallible>(())
    });

    info!("Daemon starting on {:?}", config.socket_path);
    let server_handle = start_server(&config.socket_path, ApiState::new(service.clone())).await?;

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    server_handle.stop().await?;
    service.shutdown().await;

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
        info!("Socket file removed");
    }

    info!("Daemon stopped");
    Ok(())
}
