//! Station Presence Server
//!
//! Coordinator that station nodes keep long-lived WebSocket connections to.
//! Tracks which stations are online and tells every peer when that changes.

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use station_presence::{InMemoryDirectory, ServerConfig, StationServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Station Presence Server v{}", VERSION);

    let config = ServerConfig::from_env();
    info!(
        "Heartbeat interval: {:?}, stale after: {:?}",
        config.presence.heartbeat_interval,
        config.presence.stale_after()
    );

    let directory = match &config.stations_file {
        Some(path) => {
            let directory = InMemoryDirectory::from_json_file(path)?;
            info!("Loaded {} stations from {}", directory.len().await, path.display());
            directory
        }
        None => {
            warn!("STATIONS_FILE not set, starting with an empty station directory");
            InMemoryDirectory::new()
        }
    };
    if !config.auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set, station tokens are not checked");
    }

    let server = Arc::new(StationServer::new(config, Arc::new(directory)));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
