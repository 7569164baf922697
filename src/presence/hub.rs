//! Presence Hub
//!
//! Wires the registry, gate, monitor and fan-out together and exposes the
//! operations a transport needs: accept, handle an inbound message,
//! disconnect, and shut down.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::broadcast::{FanOut, Outbox, PresenceBroadcaster, PresenceHook, Publisher};
use super::gate::{Authenticated, AuthenticationGate};
use super::heartbeat::{Eviction, HeartbeatMonitor};
use super::registry::ConnectionRegistry;
use super::rooms::ChannelMultiplexer;
use super::{PresenceConfig, PresenceError};
use crate::core::time::now;
use crate::core::{ConnectionId, ConnectionType, StationId, Timestamp};
use crate::directory::{DirectoryClient, StationDirectory};
use crate::network::auth::AuthConfig;
use crate::network::protocol::{
    AuthenticatedInfo, ClientMessage, ConnectedInfo, ErrorPayload, HeartbeatAckInfo, ServerMessage,
    ShutdownInfo,
};

/// Greeting sent to every accepted connection.
pub const CONNECTED_MESSAGE: &str = "Connected to station coordinator";

/// Composition root of the presence layer.
pub struct PresenceHub {
    registry: Arc<ConnectionRegistry>,
    gate: AuthenticationGate,
    monitor: Arc<HeartbeatMonitor>,
    directory: DirectoryClient,
}

impl PresenceHub {
    /// Hub backed by `directory`.
    pub fn new(config: PresenceConfig, directory: Arc<dyn StationDirectory>, auth: AuthConfig) -> Self {
        Self::with_hooks(config, directory, auth, Vec::new())
    }

    /// Hub that also notifies `hooks` on every presence transition.
    pub fn with_hooks(
        config: PresenceConfig,
        directory: Arc<dyn StationDirectory>,
        auth: AuthConfig,
        hooks: Vec<Arc<dyn PresenceHook>>,
    ) -> Self {
        let publisher = Arc::new(Publisher::new(Arc::new(ChannelMultiplexer::new())));
        let broadcaster = hooks
            .into_iter()
            .fold(PresenceBroadcaster::new(publisher, config.exclude_origin), |b, hook| {
                b.with_hook(hook)
            });
        let registry = Arc::new(ConnectionRegistry::new(broadcaster));
        let directory = DirectoryClient::new(directory, config.directory_timeout);
        let gate = AuthenticationGate::new(registry.clone(), directory.clone(), auth);
        let monitor = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            directory.clone(),
            config.heartbeat_interval,
            config.stale_after(),
        ));

        Self {
            registry,
            gate,
            monitor,
            directory,
        }
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }

    /// Register a freshly accepted transport and greet it.
    pub async fn accept(&self, connection_type: ConnectionType, outbox: Outbox) -> ConnectionId {
        let at = now();
        let id = self.registry.register(connection_type, outbox, at).await;
        self.registry
            .publisher()
            .send_to(
                &id,
                ServerMessage::Connected(ConnectedInfo {
                    message: CONNECTED_MESSAGE.into(),
                    timestamp: at,
                }),
            )
            .await;
        id
    }

    /// Authenticate a connection.
    pub async fn authenticate(
        &self,
        connection: ConnectionId,
        station: &StationId,
        token: Option<&str>,
    ) -> Result<Authenticated, PresenceError> {
        self.gate.authenticate(connection, station, token, now()).await
    }

    /// Apply a heartbeat. Returns the heartbeat timestamp on record afterwards,
    /// which is the stored one when the reported time is older.
    pub async fn heartbeat(
        &self,
        connection: ConnectionId,
        station: &StationId,
        timestamp: Timestamp,
    ) -> Result<Timestamp, PresenceError> {
        self.monitor.process(connection, station, timestamp, now()).await
    }

    /// Dispatch an inbound message and queue the reply on the sender's outbox.
    /// Rejections are replies; they never close the connection.
    pub async fn handle_message(&self, connection: ConnectionId, message: ClientMessage) {
        let reply = match message {
            ClientMessage::Authenticate(req) => {
                match self.authenticate(connection, &req.station_id, req.token.as_deref()).await {
                    Ok(auth) => ServerMessage::Authenticated(AuthenticatedInfo {
                        station_id: auth.station_id,
                        station_name: auth.station_name,
                        timestamp: auth.timestamp,
                    }),
                    Err(err) => {
                        debug!(connection = %connection, station = %req.station_id, error = %err, "Authentication failed");
                        ServerMessage::AuthError(ErrorPayload::new(err))
                    }
                }
            }
            ClientMessage::Heartbeat(req) => {
                match self.heartbeat(connection, &req.station_id, req.timestamp).await {
                    Ok(timestamp) => ServerMessage::HeartbeatAck(HeartbeatAckInfo {
                        station_id: req.station_id,
                        timestamp,
                    }),
                    Err(err) => ServerMessage::HeartbeatError(ErrorPayload::new(err)),
                }
            }
        };
        self.registry.publisher().send_to(&connection, reply).await;
    }

    /// Deliver a message to every connection bound to `station`.
    pub async fn send_to_station(&self, station: &StationId, message: ServerMessage) -> Vec<ConnectionId> {
        self.registry
            .publisher()
            .publish(&FanOut::Room(station.clone()), None, message)
            .await
    }

    /// Tear a connection down. Safe to call more than once.
    pub async fn disconnect(&self, connection: ConnectionId) -> Option<StationId> {
        let station = self.registry.unregister(connection, now()).await?;
        if !self.registry.is_online(&station).await {
            self.record_offline(&station).await;
        }
        Some(station)
    }

    /// Run one staleness sweep.
    pub async fn sweep(&self, now: Timestamp) -> Vec<Eviction> {
        self.monitor.sweep(now).await
    }

    /// Start the periodic sweep; it stops when `shutdown` fires.
    pub fn spawn_sweeper(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        self.monitor.clone().spawn(shutdown)
    }

    /// Close every connection, announcing and recording each station that
    /// goes offline. Directory failures are logged.
    pub async fn shutdown(&self, reason: &str) {
        self.registry
            .publisher()
            .publish(
                &FanOut::Global,
                None,
                ServerMessage::Shutdown(ShutdownInfo { reason: reason.into() }),
            )
            .await;

        let stations = self.registry.close_all(now()).await;
        for station in &stations {
            self.record_offline(station).await;
        }
        info!(stations = stations.len(), "Presence hub shut down");
    }

    async fn record_offline(&self, station: &StationId) {
        if let Err(err) = self.registry.persist_presence(station, &self.directory).await {
            warn!(station = %station, error = %err, "Failed to record station offline");
        }
    }
}
