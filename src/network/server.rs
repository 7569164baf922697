//! WebSocket Station Server
//!
//! Async WebSocket server for station connections.
//! Accepts transports, feeds their frames to the presence hub, and drains
//! each connection's outbound queue back onto the socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::{ConnectionId, ConnectionType};
use crate::directory::StationDirectory;
use crate::network::auth::AuthConfig;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
use crate::presence::{env_parse, Outbound, PresenceConfig, PresenceHub};

/// Reason sent to every connection when the server stops.
pub const SHUTDOWN_REASON: &str = "Server shutting down";

/// How long a closing connection may take to flush its queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Server version string.
    pub version: String,
    /// Heartbeat and fan-out policy.
    pub presence: PresenceConfig,
    /// Credential token validation.
    pub auth: AuthConfig,
    /// JSON file seeding the in-memory directory.
    pub stations_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            version: env!("CARGO_PKG_VERSION").to_string(),
            presence: PresenceConfig::default(),
            auth: AuthConfig::default(),
            stations_file: None,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            version: defaults.version,
            presence: PresenceConfig::from_env(),
            auth: AuthConfig::from_env(),
            stations_file: std::env::var("STATIONS_FILE").ok().map(PathBuf::from),
        }
    }
}

/// Station server errors.
#[derive(Debug, thiserror::Error)]
pub enum StationServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Read the client kind from the handshake query string.
/// Absent or unrecognised values fall back to the default kind.
pub fn connection_type_from_query(query: Option<&str>) -> ConnectionType {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "connectionType")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or_default()
}

/// The station server.
pub struct StationServer {
    /// Server configuration.
    config: ServerConfig,
    /// Presence coordination.
    hub: Arc<PresenceHub>,
    /// One permit per open socket, taken at accept and held through the handshake.
    connection_slots: Arc<Semaphore>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl StationServer {
    /// Create a new server backed by `directory`.
    pub fn new(config: ServerConfig, directory: Arc<dyn StationDirectory>) -> Self {
        let hub = Arc::new(PresenceHub::new(
            config.presence.clone(),
            directory,
            config.auth.clone(),
        ));
        Self::with_hub(config, hub)
    }

    /// Create a server around an existing hub.
    pub fn with_hub(config: ServerConfig, hub: Arc<PresenceHub>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let connection_slots = Arc::new(Semaphore::new(config.max_connections.min(Semaphore::MAX_PERMITS)));
        Self {
            config,
            hub,
            connection_slots,
            shutdown_tx,
        }
    }

    /// Presence hub.
    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), StationServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown, then retire
    /// every connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), StationServerError> {
        info!("Station coordinator v{} listening on {}", self.config.version, listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sweeper = self.hub.spawn_sweeper(self.shutdown_tx.subscribe());

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let Ok(slot) = self.connection_slots.clone().try_acquire_owned() else {
                                warn!("Connection limit reached, rejecting {}", addr);
                                Self::reject_connection(stream, addr);
                                continue;
                            };

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr, slot);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        if let Err(e) = sweeper.await {
            warn!("Heartbeat sweeper ended abnormally: {}", e);
        }
        self.hub.shutdown(SHUTDOWN_REASON).await;
        Ok(())
    }

    /// Handle a new WebSocket connection. `slot` is released when the task ends.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, slot: OwnedSemaphorePermit) {
        let hub = self.hub.clone();

        tokio::spawn(async move {
            let _slot = slot;
            let mut connection_type = ConnectionType::default();
            let handshake = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                connection_type = connection_type_from_query(req.uri().query());
                Ok(resp)
            });
            let ws_stream = match handshake.await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Outbound>();
            let connection = hub.accept(connection_type, outbox).await;
            info!(connection = %connection, peer = %addr, kind = %connection_type, "Connection accepted");

            // Drains the outbound queue; ends on a close instruction or when
            // the hub drops the queue.
            let mut writer = tokio::spawn(async move {
                while let Some(item) = outbox_rx.recv().await {
                    match item {
                        Outbound::Message(msg) => {
                            let text = match msg.to_json() {
                                Ok(t) => t,
                                Err(e) => {
                                    error!("Failed to serialize message: {}", e);
                                    continue;
                                }
                            };
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Outbound::Close { reason } => {
                            let frame = CloseFrame {
                                code: CloseCode::Away,
                                reason: reason.into(),
                            };
                            let _ = ws_sender.send(Message::Close(Some(frame))).await;
                            return;
                        }
                    }
                }
                let _ = ws_sender.send(Message::Close(None)).await;
            });

            let mut writer_done = false;
            loop {
                tokio::select! {
                    frame = ws_receiver.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                                Ok(msg) => hub.handle_message(connection, msg).await,
                                Err(e) => {
                                    debug!(connection = %connection, "Invalid message: {}", e);
                                    send_error(&hub, connection, ErrorCode::InvalidInput, "Invalid message format").await;
                                }
                            },
                            Some(Ok(Message::Binary(_))) => {
                                send_error(&hub, connection, ErrorCode::Unsupported, "Binary frames are not supported").await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(connection = %connection, "Client disconnected");
                                break;
                            }
                            Some(Err(e)) => {
                                error!(connection = %connection, "WebSocket error: {}", e);
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                    _ = &mut writer, if !writer_done => {
                        writer_done = true;
                        debug!(connection = %connection, "Outbound side closed");
                        break;
                    }
                }
            }

            // Cleanup
            hub.disconnect(connection).await;
            if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
                debug!(connection = %connection, "Writer did not drain in time");
            }

            info!(connection = %connection, peer = %addr, "Connection cleaned up");
        });
    }

    /// Complete the handshake only to tell the client it was turned away.
    fn reject_connection(stream: TcpStream, addr: SocketAddr) {
        tokio::spawn(async move {
            let mut ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("Handshake failed for rejected {}: {}", addr, e);
                    return;
                }
            };
            let msg = ServerMessage::Error(ServerError {
                code: ErrorCode::ServerOverloaded,
                message: "Connection limit reached".to_string(),
            });
            if let Ok(text) = msg.to_json() {
                let _ = ws.send(Message::Text(text)).await;
            }
            let _ = ws.close(None).await;
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.hub.connection_count().await
    }

    /// Sockets that can still be admitted, counting those mid-handshake as taken.
    pub fn available_slots(&self) -> usize {
        self.connection_slots.available_permits()
    }
}

async fn send_error(hub: &PresenceHub, connection: ConnectionId, code: ErrorCode, message: &str) {
    let msg = ServerMessage::Error(ServerError {
        code,
        message: message.to_string(),
    });
    hub.registry().publisher().send_to(&connection, msg).await;
}
