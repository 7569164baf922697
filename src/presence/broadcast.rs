//! Fan-out
//!
//! [`Publisher`] owns the outbound queue of every open connection and
//! delivers a message either to everyone or to one station's room.
//! [`PresenceBroadcaster`] sits on top and turns refcount transitions into
//! `stationStatusUpdate` events plus [`PresenceHook`] callbacks.
//!
//! Queues are unbounded so enqueueing never waits; the registry enqueues
//! while it holds a station's lock, which is what keeps transitions for one
//! station in order on every peer.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use super::rooms::ChannelMultiplexer;
use crate::core::{ConnectionId, StationId, Timestamp};
use crate::network::protocol::{ServerMessage, StationStatus};

/// Item placed on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialize and send.
    Message(ServerMessage),
    /// Close the transport.
    Close {
        /// Close reason sent with the close frame.
        reason: String,
    },
}

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<Outbound>;

/// Receiving half of a connection's outbound queue.
pub type OutboxReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Recipient selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOut {
    /// Every open connection.
    Global,
    /// Connections bound to one station.
    Room(StationId),
}

/// Delivers messages to open connections.
#[derive(Debug)]
pub struct Publisher {
    peers: RwLock<BTreeMap<ConnectionId, Outbox>>,
    rooms: Arc<ChannelMultiplexer>,
}

impl Publisher {
    /// Publisher resolving room fan-out through `rooms`.
    pub fn new(rooms: Arc<ChannelMultiplexer>) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            rooms,
        }
    }

    /// Room membership used for [`FanOut::Room`].
    pub fn rooms(&self) -> &Arc<ChannelMultiplexer> {
        &self.rooms
    }

    /// Make a connection reachable.
    pub async fn attach(&self, id: ConnectionId, outbox: Outbox) {
        self.peers.write().await.insert(id, outbox);
    }

    /// Stop delivering to a connection. Dropping the returned sender lets the
    /// writer task drain and finish.
    pub async fn detach(&self, id: &ConnectionId) -> Option<Outbox> {
        self.peers.write().await.remove(id)
    }

    /// Number of reachable connections.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Send to a single connection.
    pub async fn send_to(&self, id: &ConnectionId, message: ServerMessage) -> bool {
        let peers = self.peers.read().await;
        match peers.get(id) {
            Some(outbox) => outbox.send(Outbound::Message(message)).is_ok(),
            None => false,
        }
    }

    /// Ask a connection's transport task to close.
    pub async fn close(&self, id: &ConnectionId, reason: impl Into<String>) -> bool {
        let peers = self.peers.read().await;
        match peers.get(id) {
            Some(outbox) => outbox.send(Outbound::Close { reason: reason.into() }).is_ok(),
            None => false,
        }
    }

    /// Deliver `message` to the selected connections, skipping `except`.
    /// Returns the connections it was enqueued for.
    pub async fn publish(
        &self,
        fan_out: &FanOut,
        except: Option<ConnectionId>,
        message: ServerMessage,
    ) -> Vec<ConnectionId> {
        let targets: Vec<ConnectionId> = match fan_out {
            FanOut::Global => self.peers.read().await.keys().copied().collect(),
            FanOut::Room(station) => self.rooms.members_of(station).await.into_iter().collect(),
        };

        let peers = self.peers.read().await;
        let mut delivered = Vec::with_capacity(targets.len());
        for id in targets {
            if Some(id) == except {
                continue;
            }
            let Some(outbox) = peers.get(&id) else {
                continue;
            };
            if outbox.send(Outbound::Message(message.clone())).is_ok() {
                delivered.push(id);
            } else {
                trace!(connection = %id, "Outbox closed, skipping");
            }
        }
        delivered
    }
}

/// Hook invoked on station presence transitions.
///
/// Called while the station's lock is held, so implementations must not
/// block; hand work off to a task or channel instead. This is where an
/// external sync coordinator attaches.
pub trait PresenceHook: Send + Sync {
    /// Station went from zero to one live connection.
    fn station_online(&self, _station: &StationId, _at: Timestamp) {}

    /// Station's last live connection closed.
    fn station_offline(&self, _station: &StationId, _at: Timestamp) {}
}

/// Announces station online/offline transitions.
pub struct PresenceBroadcaster {
    publisher: Arc<Publisher>,
    exclude_origin: bool,
    hooks: Vec<Arc<dyn PresenceHook>>,
}

impl PresenceBroadcaster {
    /// Broadcaster publishing through `publisher`.
    pub fn new(publisher: Arc<Publisher>, exclude_origin: bool) -> Self {
        Self {
            publisher,
            exclude_origin,
            hooks: Vec::new(),
        }
    }

    /// Register a transition hook.
    pub fn with_hook(mut self, hook: Arc<dyn PresenceHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Underlying publisher.
    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Announce a transition to every connection, optionally skipping the
    /// connection that caused it. Must only be called on a 0↔1 crossing.
    pub async fn announce(
        &self,
        station: &StationId,
        is_online: bool,
        at: Timestamp,
        origin: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let except = if self.exclude_origin { origin } else { None };
        let message = ServerMessage::StationStatusUpdate(StationStatus {
            station_id: station.clone(),
            is_online,
            timestamp: at,
        });
        let recipients = self.publisher.publish(&FanOut::Global, except, message).await;

        for hook in &self.hooks {
            if is_online {
                hook.station_online(station, at);
            } else {
                hook.station_offline(station, at);
            }
        }

        debug!(
            station = %station,
            is_online,
            recipients = recipients.len(),
            "Presence transition announced"
        );
        recipients
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Drain everything currently queued for a connection.
    pub(crate) fn drain(rx: &mut OutboxReceiver) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    /// Status updates in a drained queue.
    pub(crate) fn status_updates(items: &[Outbound]) -> Vec<StationStatus> {
        items
            .iter()
            .filter_map(|item| match item {
                Outbound::Message(ServerMessage::StationStatusUpdate(status)) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    #[derive(Default)]
    pub(crate) struct RecordingHook {
        pub(crate) events: Mutex<Vec<(StationId, bool)>>,
    }

    impl PresenceHook for RecordingHook {
        fn station_online(&self, station: &StationId, _at: Timestamp) {
            self.events.lock().unwrap().push((station.clone(), true));
        }

        fn station_offline(&self, station: &StationId, _at: Timestamp) {
            self.events.lock().unwrap().push((station.clone(), false));
        }
    }

    async fn attached(publisher: &Publisher) -> (ConnectionId, OutboxReceiver) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        publisher.attach(id, tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_global_publish_skips_except() {
        let publisher = Publisher::new(Arc::new(ChannelMultiplexer::new()));
        let (a, mut rx_a) = attached(&publisher).await;
        let (b, mut rx_b) = attached(&publisher).await;
        let msg = ServerMessage::Shutdown(crate::network::protocol::ShutdownInfo { reason: "x".into() });

        let delivered = publisher.publish(&FanOut::Global, Some(a), msg).await;

        assert_eq!(delivered, vec![b]);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn test_room_publish_targets_members_only() {
        let rooms = Arc::new(ChannelMultiplexer::new());
        let publisher = Publisher::new(rooms.clone());
        let (a, mut rx_a) = attached(&publisher).await;
        let (_b, mut rx_b) = attached(&publisher).await;
        let s1 = StationId::new("S1");
        rooms.join(a, &s1).await;

        let msg = ServerMessage::Shutdown(crate::network::protocol::ShutdownInfo { reason: "x".into() });
        let delivered = publisher.publish(&FanOut::Room(s1), None, msg).await;

        assert_eq!(delivered, vec![a]);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_detached_peer_not_reached() {
        let publisher = Publisher::new(Arc::new(ChannelMultiplexer::new()));
        let (a, _rx) = attached(&publisher).await;

        assert!(publisher.detach(&a).await.is_some());
        assert!(publisher.detach(&a).await.is_none());
        assert!(!publisher.close(&a, "gone").await);
        assert_eq!(publisher.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_announce_excludes_origin_and_calls_hooks() {
        let publisher = Arc::new(Publisher::new(Arc::new(ChannelMultiplexer::new())));
        let hook = Arc::new(RecordingHook::default());
        let broadcaster = PresenceBroadcaster::new(publisher.clone(), true).with_hook(hook.clone());
        let (origin, mut rx_origin) = attached(&publisher).await;
        let (_peer, mut rx_peer) = attached(&publisher).await;
        let s1 = StationId::new("S1");

        broadcaster.announce(&s1, true, crate::core::time::now(), Some(origin)).await;

        assert!(drain(&mut rx_origin).is_empty());
        let updates = status_updates(&drain(&mut rx_peer));
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_online);
        assert_eq!(*hook.events.lock().unwrap(), vec![(s1, true)]);
    }

    #[tokio::test]
    async fn test_announce_can_include_origin() {
        let publisher = Arc::new(Publisher::new(Arc::new(ChannelMultiplexer::new())));
        let broadcaster = PresenceBroadcaster::new(publisher.clone(), false);
        let (origin, mut rx_origin) = attached(&publisher).await;

        broadcaster
            .announce(&StationId::new("S1"), false, crate::core::time::now(), Some(origin))
            .await;

        assert_eq!(status_updates(&drain(&mut rx_origin)).len(), 1);
    }
}
