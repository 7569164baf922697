//! Connection Registry
//!
//! Single source of truth for which connections exist, whether they are
//! authenticated, and which station each is bound to. Also keeps the
//! per-station live-connection refcount that defines presence.
//!
//! Locking:
//! - `connections` is a coarse map lock, held only for brief lookups and
//!   field updates.
//! - Every station has a slot with a `state` lock. Anything that changes a
//!   station's refcount (promote, unregister, stale eviction) holds it for
//!   the whole in-memory transition, including room membership and the
//!   presence announcement. Order is always station → connections → peers.
//! - A separate per-station `io` lock serializes directory writes, so the
//!   state lock is never held across external I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::broadcast::{Outbox, PresenceBroadcaster, Publisher};
use super::rooms::ChannelMultiplexer;
use super::PresenceError;
use crate::core::{ConnectionId, ConnectionType, StationId, Timestamp};
use crate::directory::{DirectoryClient, DirectoryError};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, not yet bound to a station.
    Unauthenticated,
    /// Bound to a station.
    Authenticated,
    /// Torn down. Terminal.
    Closed,
}

/// A live transport session.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Bound station, set once on authentication.
    pub station_id: Option<StationId>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Latest accepted heartbeat time as reported by the client. Never decreases.
    pub last_heartbeat: Option<Timestamp>,
    /// Server time of the latest sign of life. Drives staleness.
    pub last_seen: Timestamp,
    /// Client kind.
    pub connection_type: ConnectionType,
    /// Accept time.
    pub connected_at: Timestamp,
}

impl Connection {
    /// Whether the connection is bound to a station.
    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    fn is_stale(&self, cutoff: Timestamp) -> bool {
        self.is_authenticated() && self.last_seen < cutoff
    }
}

/// Result of [`ConnectionRegistry::promote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// Connection is now bound. `came_online` is true on the 0→1 crossing.
    Promoted {
        /// Whether this promotion brought the station online.
        came_online: bool,
    },
    /// Connection was already bound to the given station.
    AlreadyBound(StationId),
    /// No such open connection.
    NotFound,
}

/// Successful result of [`ConnectionRegistry::touch_heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// Stored heartbeat advanced to the reported time.
    Updated,
    /// Reported time was older than the stored one, which is kept.
    Ignored {
        /// Heartbeat timestamp still on record.
        stored: Timestamp,
    },
}

impl TouchOutcome {
    /// Heartbeat timestamp on record after the touch.
    pub fn stored(self, reported: Timestamp) -> Timestamp {
        match self {
            Self::Updated => reported,
            Self::Ignored { stored } => stored,
        }
    }
}

#[derive(Debug, Default)]
struct StationPresence {
    live: BTreeSet<ConnectionId>,
    last_heartbeat: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct StationSlot {
    state: Mutex<StationPresence>,
    io: Mutex<()>,
}

/// Table of open connections and station presence.
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Connection>>,
    stations: RwLock<BTreeMap<StationId, Arc<StationSlot>>>,
    rooms: Arc<ChannelMultiplexer>,
    broadcaster: PresenceBroadcaster,
}

impl ConnectionRegistry {
    /// Registry announcing transitions through `broadcaster`.
    pub fn new(broadcaster: PresenceBroadcaster) -> Self {
        let rooms = broadcaster.publisher().rooms().clone();
        Self {
            connections: RwLock::new(BTreeMap::new()),
            stations: RwLock::new(BTreeMap::new()),
            rooms,
            broadcaster,
        }
    }

    /// Publisher used for all deliveries.
    pub fn publisher(&self) -> &Arc<Publisher> {
        self.broadcaster.publisher()
    }

    /// Room membership.
    pub fn rooms(&self) -> &Arc<ChannelMultiplexer> {
        &self.rooms
    }

    /// Insert a new unauthenticated connection.
    pub async fn register(
        &self,
        connection_type: ConnectionType,
        outbox: Outbox,
        at: Timestamp,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.write().await.insert(
            id,
            Connection {
                id,
                station_id: None,
                state: ConnectionState::Unauthenticated,
                last_heartbeat: None,
                last_seen: at,
                connection_type,
                connected_at: at,
            },
        );
        self.publisher().attach(id, outbox).await;
        debug!(connection = %id, kind = %connection_type, "Connection registered");
        id
    }

    /// Bind a connection to a station and count it toward the station's presence.
    pub async fn promote(&self, id: ConnectionId, station: &StationId, at: Timestamp) -> PromoteOutcome {
        let slot = self.slot(station).await;
        let mut presence = slot.state.lock().await;

        {
            let mut conns = self.connections.write().await;
            let Some(conn) = conns.get_mut(&id) else {
                return PromoteOutcome::NotFound;
            };
            if let Some(bound) = &conn.station_id {
                return PromoteOutcome::AlreadyBound(bound.clone());
            }
            conn.station_id = Some(station.clone());
            conn.state = ConnectionState::Authenticated;
            conn.last_heartbeat = Some(at);
            conn.last_seen = conn.last_seen.max(at);
        }

        self.rooms.join(id, station).await;
        presence.live.insert(id);
        presence.last_heartbeat = presence.last_heartbeat.max(Some(at));

        let came_online = presence.live.len() == 1;
        if came_online {
            info!(station = %station, connection = %id, "Station online");
            self.broadcaster.announce(station, true, at, Some(id)).await;
        }
        PromoteOutcome::Promoted { came_online }
    }

    /// Record a heartbeat reported for `at` and received at server time `seen`.
    /// Rejected unless the connection is authenticated. A reported time older
    /// than the stored one is not applied, but `seen` still refreshes liveness.
    pub async fn touch_heartbeat(
        &self,
        id: ConnectionId,
        at: Timestamp,
        seen: Timestamp,
    ) -> Result<TouchOutcome, PresenceError> {
        let station = self
            .binding(&id)
            .await
            .ok_or(PresenceError::UnauthorizedHeartbeat)?;

        let slot = self.slot(&station).await;
        let mut presence = slot.state.lock().await;

        let outcome = {
            let mut conns = self.connections.write().await;
            let conn = conns
                .get_mut(&id)
                .filter(|c| c.is_authenticated())
                .ok_or(PresenceError::UnauthorizedHeartbeat)?;
            conn.last_seen = conn.last_seen.max(seen);
            match conn.last_heartbeat {
                Some(stored) if at < stored => TouchOutcome::Ignored { stored },
                _ => {
                    conn.last_heartbeat = Some(at);
                    TouchOutcome::Updated
                }
            }
        };

        if outcome == TouchOutcome::Updated {
            presence.last_heartbeat = presence.last_heartbeat.max(Some(at));
        }
        Ok(outcome)
    }

    /// Remove a connection. Returns the station it was bound to, if any.
    /// Unregistering an already closed id is a no-op.
    pub async fn unregister(&self, id: ConnectionId, at: Timestamp) -> Option<StationId> {
        self.retire(id, at, None).await.and_then(|r| r.station)
    }

    /// Evict every authenticated connection last seen (server time) before
    /// `cutoff`. Evicted connections are told to close.
    pub async fn evict_stale(&self, cutoff: Timestamp, at: Timestamp) -> Vec<(ConnectionId, StationId)> {
        let candidates: Vec<ConnectionId> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.is_stale(cutoff))
            .map(|c| c.id)
            .collect();

        let mut evicted = Vec::new();
        for id in candidates {
            // Re-checked under the station lock; a heartbeat may have landed.
            if let Some(Retired { station: Some(station) }) = self.retire(id, at, Some(cutoff)).await {
                evicted.push((id, station));
            }
        }
        evicted
    }

    /// Remove every connection, announcing offline transitions along the way.
    /// Returns each station that was bound to at least one of them.
    pub async fn close_all(&self, at: Timestamp) -> Vec<StationId> {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        let mut stations = BTreeSet::new();
        for id in ids {
            if let Some(station) = self.unregister(id, at).await {
                stations.insert(station);
            }
        }
        stations.into_iter().collect()
    }

    /// Write a station's current presence to the directory.
    ///
    /// Writes for one station are serialized and each carries the state at
    /// the moment it is taken, so the directory converges on the latest
    /// in-memory state even when writes are triggered concurrently.
    pub async fn persist_presence(
        &self,
        station: &StationId,
        directory: &DirectoryClient,
    ) -> Result<(), DirectoryError> {
        let slot = self.slot(station).await;
        let _io = slot.io.lock().await;

        let (is_online, last_heartbeat) = {
            let presence = slot.state.lock().await;
            (!presence.live.is_empty(), presence.last_heartbeat)
        };
        let Some(last_heartbeat) = last_heartbeat else {
            return Ok(());
        };

        directory.set_online_and_heartbeat(station, is_online, last_heartbeat).await
    }

    /// Station bound to an authenticated connection.
    pub async fn binding(&self, id: &ConnectionId) -> Option<StationId> {
        self.connections
            .read()
            .await
            .get(id)
            .filter(|c| c.is_authenticated())
            .and_then(|c| c.station_id.clone())
    }

    /// Snapshot of a connection.
    pub async fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.read().await.get(id).cloned()
    }

    /// Lifecycle state; ids are never reused, so an unknown id is closed.
    pub async fn state_of(&self, id: &ConnectionId) -> ConnectionState {
        self.connections
            .read()
            .await
            .get(id)
            .map_or(ConnectionState::Closed, |c| c.state)
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of authenticated connections bound to a station.
    pub async fn live_count(&self, station: &StationId) -> usize {
        let slot = self.stations.read().await.get(station).cloned();
        match slot {
            Some(slot) => slot.state.lock().await.live.len(),
            None => 0,
        }
    }

    /// Whether a station currently has a live connection.
    pub async fn is_online(&self, station: &StationId) -> bool {
        self.live_count(station).await > 0
    }

    async fn slot(&self, station: &StationId) -> Arc<StationSlot> {
        if let Some(slot) = self.stations.read().await.get(station) {
            return slot.clone();
        }
        self.stations
            .write()
            .await
            .entry(station.clone())
            .or_default()
            .clone()
    }

    async fn retire(&self, id: ConnectionId, at: Timestamp, stale_cutoff: Option<Timestamp>) -> Option<Retired> {
        loop {
            let binding = match self.connections.read().await.get(&id) {
                None => return None,
                Some(conn) => conn.station_id.clone(),
            };

            let Some(station) = binding else {
                if stale_cutoff.is_some() {
                    return None;
                }
                let mut conns = self.connections.write().await;
                match conns.get(&id) {
                    None => return None,
                    // Promoted since we looked; take the station path.
                    Some(conn) if conn.station_id.is_some() => continue,
                    Some(_) => {}
                }
                conns.remove(&id);
                drop(conns);
                self.publisher().detach(&id).await;
                debug!(connection = %id, "Unauthenticated connection closed");
                return Some(Retired { station: None });
            };

            let slot = self.slot(&station).await;
            let mut presence = slot.state.lock().await;

            {
                let mut conns = self.connections.write().await;
                let Some(conn) = conns.get(&id) else {
                    return None;
                };
                if let Some(cutoff) = stale_cutoff {
                    if !conn.is_stale(cutoff) {
                        return None;
                    }
                }
                conns.remove(&id);
            }

            self.rooms.leave(id, &station).await;
            presence.live.remove(&id);

            if stale_cutoff.is_some() {
                self.publisher().close(&id, PresenceError::StaleConnection.to_string()).await;
            }
            self.publisher().detach(&id).await;

            if presence.live.is_empty() {
                info!(station = %station, connection = %id, "Station offline");
                self.broadcaster.announce(&station, false, at, Some(id)).await;
            }
            debug!(connection = %id, station = %station, remaining = presence.live.len(), "Connection closed");
            return Some(Retired { station: Some(station) });
        }
    }
}

#[derive(Debug)]
struct Retired {
    station: Option<StationId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::now;
    use crate::directory::{InMemoryDirectory, StationRow};
    use crate::presence::broadcast::tests::{drain, status_updates};
    use crate::presence::broadcast::{Outbound, OutboxReceiver};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_registry() -> ConnectionRegistry {
        let rooms = Arc::new(ChannelMultiplexer::new());
        let publisher = Arc::new(Publisher::new(rooms));
        ConnectionRegistry::new(PresenceBroadcaster::new(publisher, true))
    }

    async fn connect(registry: &ConnectionRegistry) -> (ConnectionId, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(ConnectionType::LocalNode, tx, now()).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_register_starts_unauthenticated() {
        let registry = test_registry();
        let (c1, _rx) = connect(&registry).await;

        assert_eq!(registry.state_of(&c1).await, ConnectionState::Unauthenticated);
        assert_eq!(registry.connection_count().await, 1);
        assert!(registry.binding(&c1).await.is_none());
    }

    #[tokio::test]
    async fn test_promote_counts_and_announces_once() {
        let registry = test_registry();
        let s1 = StationId::new("S1");
        let (_observer, mut rx_obs) = connect(&registry).await;
        let (c1, _rx1) = connect(&registry).await;
        let (c2, _rx2) = connect(&registry).await;

        assert_eq!(registry.promote(c1, &s1, now()).await, PromoteOutcome::Promoted { came_online: true });
        assert_eq!(registry.promote(c2, &s1, now()).await, PromoteOutcome::Promoted { came_online: false });

        assert_eq!(registry.live_count(&s1).await, 2);
        assert_eq!(registry.rooms().members_of(&s1).await, BTreeSet::from([c1, c2]));
        let updates = status_updates(&drain(&mut rx_obs));
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_online);
    }

    #[tokio::test]
    async fn test_promote_already_bound_and_not_found() {
        let registry = test_registry();
        let s1 = StationId::new("S1");
        let (c1, _rx) = connect(&registry).await;

        registry.promote(c1, &s1, now()).await;
        assert_eq!(
            registry.promote(c1, &StationId::new("S2"), now()).await,
            PromoteOutcome::AlreadyBound(s1.clone())
        );
        assert_eq!(registry.live_count(&s1).await, 1);

        assert_eq!(registry.promote(ConnectionId::new(), &s1, now()).await, PromoteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_touch_rejected_unless_authenticated() {
        let registry = test_registry();
        let (c1, _rx) = connect(&registry).await;

        assert_eq!(
            registry.touch_heartbeat(c1, now(), now()).await,
            Err(PresenceError::UnauthorizedHeartbeat)
        );
        assert_eq!(
            registry.touch_heartbeat(ConnectionId::new(), now(), now()).await,
            Err(PresenceError::UnauthorizedHeartbeat)
        );
    }

    #[tokio::test]
    async fn test_touch_is_monotonic() {
        let registry = test_registry();
        let (c1, _rx) = connect(&registry).await;
        let t0 = now();
        registry.promote(c1, &StationId::new("S1"), t0).await;

        let later = t0 + chrono::Duration::seconds(30);
        let earlier = t0 + chrono::Duration::seconds(10);
        assert_eq!(registry.touch_heartbeat(c1, later, later).await, Ok(TouchOutcome::Updated));
        assert_eq!(
            registry.touch_heartbeat(c1, earlier, later).await,
            Ok(TouchOutcome::Ignored { stored: later })
        );

        let conn = registry.connection(&c1).await.unwrap();
        assert_eq!(conn.last_heartbeat, Some(later));
    }

    #[tokio::test]
    async fn test_ignored_heartbeat_still_refreshes_last_seen() {
        let registry = test_registry();
        let (c1, _rx) = connect(&registry).await;
        let t0 = now();
        registry.promote(c1, &StationId::new("S1"), t0).await;

        let seen = t0 + chrono::Duration::seconds(60);
        let behind = t0 - chrono::Duration::minutes(10);
        assert_eq!(
            registry.touch_heartbeat(c1, behind, seen).await,
            Ok(TouchOutcome::Ignored { stored: t0 })
        );

        let conn = registry.connection(&c1).await.unwrap();
        assert_eq!(conn.last_heartbeat, Some(t0));
        assert_eq!(conn.last_seen, seen);
    }

    #[tokio::test]
    async fn test_last_unregister_goes_offline() {
        let registry = test_registry();
        let s1 = StationId::new("S1");
        let (_observer, mut rx_obs) = connect(&registry).await;
        let (c1, _rx1) = connect(&registry).await;
        let (c2, _rx2) = connect(&registry).await;
        registry.promote(c1, &s1, now()).await;
        registry.promote(c2, &s1, now()).await;
        drain(&mut rx_obs);

        assert_eq!(registry.unregister(c1, now()).await, Some(s1.clone()));
        assert!(registry.is_online(&s1).await);
        assert!(status_updates(&drain(&mut rx_obs)).is_empty());

        assert_eq!(registry.unregister(c2, now()).await, Some(s1.clone()));
        assert!(!registry.is_online(&s1).await);
        let updates = status_updates(&drain(&mut rx_obs));
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].is_online);
        assert!(registry.rooms().members_of(&s1).await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = test_registry();
        let s1 = StationId::new("S1");
        let (_observer, mut rx_obs) = connect(&registry).await;
        let (c1, _rx1) = connect(&registry).await;
        registry.promote(c1, &s1, now()).await;

        assert_eq!(registry.unregister(c1, now()).await, Some(s1.clone()));
        assert_eq!(registry.unregister(c1, now()).await, None);
        assert_eq!(registry.state_of(&c1).await, ConnectionState::Closed);

        let updates = status_updates(&drain(&mut rx_obs));
        assert_eq!(updates.iter().filter(|u| !u.is_online).count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_unauthenticated() {
        let registry = test_registry();
        let (c1, _rx) = connect(&registry).await;

        assert_eq!(registry.unregister(c1, now()).await, None);
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.publisher().peer_count().await, 0);
        assert_eq!(registry.promote(c1, &StationId::new("S1"), now()).await, PromoteOutcome::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_last_close_announces_once() {
        for _ in 0..50 {
            let registry = Arc::new(test_registry());
            let s1 = StationId::new("S1");
            let (_observer, mut rx_obs) = connect(&registry).await;
            let (c1, _rx1) = connect(&registry).await;
            let (c2, _rx2) = connect(&registry).await;
            registry.promote(c1, &s1, now()).await;
            registry.promote(c2, &s1, now()).await;
            drain(&mut rx_obs);

            let r1 = registry.clone();
            let r2 = registry.clone();
            let (a, b) = tokio::join!(
                tokio::spawn(async move { r1.unregister(c1, now()).await }),
                tokio::spawn(async move { r2.unregister(c2, now()).await }),
            );
            assert!(a.unwrap().is_some());
            assert!(b.unwrap().is_some());

            let offline = status_updates(&drain(&mut rx_obs));
            assert_eq!(offline.len(), 1);
            assert!(!offline[0].is_online);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_promote_announces_once() {
        for _ in 0..50 {
            let registry = Arc::new(test_registry());
            let s1 = StationId::new("S1");
            let (_observer, mut rx_obs) = connect(&registry).await;
            let (c1, _rx1) = connect(&registry).await;
            let (c2, _rx2) = connect(&registry).await;

            let (r1, r2) = (registry.clone(), registry.clone());
            let (st1, st2) = (s1.clone(), s1.clone());
            let (a, b) = tokio::join!(
                tokio::spawn(async move { r1.promote(c1, &st1, now()).await }),
                tokio::spawn(async move { r2.promote(c2, &st2, now()).await }),
            );
            let came_online = [a.unwrap(), b.unwrap()]
                .iter()
                .filter(|o| matches!(o, PromoteOutcome::Promoted { came_online: true }))
                .count();
            assert_eq!(came_online, 1);
            assert_eq!(status_updates(&drain(&mut rx_obs)).len(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_promote_racing_eviction_keeps_count_consistent() {
        for _ in 0..50 {
            let registry = Arc::new(test_registry());
            let s1 = StationId::new("S1");
            let (_observer, mut rx_obs) = connect(&registry).await;
            let (c1, _rx1) = connect(&registry).await;
            let (c2, _rx2) = connect(&registry).await;
            let t0 = now();
            registry.promote(c1, &s1, t0).await;
            drain(&mut rx_obs);

            let cutoff = t0 + chrono::Duration::hours(1);
            let later = t0 + chrono::Duration::hours(2);
            let (r1, r2, st) = (registry.clone(), registry.clone(), s1.clone());
            let (promoted, evicted) = tokio::join!(
                tokio::spawn(async move { r1.promote(c2, &st, later).await }),
                tokio::spawn(async move { r2.evict_stale(cutoff, later).await }),
            );
            let came_online = match promoted.unwrap() {
                PromoteOutcome::Promoted { came_online } => came_online,
                other => panic!("unexpected promote outcome: {other:?}"),
            };
            assert_eq!(evicted.unwrap(), vec![(c1, s1.clone())]);

            // Eviction first: offline, then online again. Promotion first: no crossing at all.
            let updates: Vec<bool> = status_updates(&drain(&mut rx_obs))
                .iter()
                .map(|u| u.is_online)
                .collect();
            if came_online {
                assert_eq!(updates, vec![false, true]);
            } else {
                assert!(updates.is_empty());
            }
            assert!(registry.is_online(&s1).await);
            assert_eq!(registry.live_count(&s1).await, 1);
            assert_eq!(registry.rooms().members_of(&s1).await, BTreeSet::from([c2]));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_heartbeat_racing_eviction_keeps_count_consistent() {
        for _ in 0..50 {
            let registry = Arc::new(test_registry());
            let s1 = StationId::new("S1");
            let (_observer, mut rx_obs) = connect(&registry).await;
            let (c1, _rx1) = connect(&registry).await;
            let t0 = now();
            registry.promote(c1, &s1, t0).await;
            drain(&mut rx_obs);

            let cutoff = t0 + chrono::Duration::hours(1);
            let later = t0 + chrono::Duration::hours(2);
            let (r1, r2) = (registry.clone(), registry.clone());
            let (touched, evicted) = tokio::join!(
                tokio::spawn(async move { r1.touch_heartbeat(c1, later, later).await }),
                tokio::spawn(async move { r2.evict_stale(cutoff, later).await }),
            );
            let touched = touched.unwrap();
            let evicted = evicted.unwrap();

            // Exactly one side wins: a fresh heartbeat spares the connection.
            let updates: Vec<bool> = status_updates(&drain(&mut rx_obs))
                .iter()
                .map(|u| u.is_online)
                .collect();
            if evicted.is_empty() {
                assert_eq!(touched, Ok(TouchOutcome::Updated));
                assert!(updates.is_empty());
                assert!(registry.is_online(&s1).await);
            } else {
                assert_eq!(evicted, vec![(c1, s1.clone())]);
                assert_eq!(touched, Err(PresenceError::UnauthorizedHeartbeat));
                assert_eq!(updates, vec![false]);
                assert!(!registry.is_online(&s1).await);
            }
            assert_eq!(
                registry.live_count(&s1).await,
                registry.rooms().members_of(&s1).await.len()
            );
        }
    }

    #[tokio::test]
    async fn test_evict_stale_closes_and_goes_offline() {
        let registry = test_registry();
        let s1 = StationId::new("S1");
        let (_observer, mut rx_obs) = connect(&registry).await;
        let (c1, mut rx1) = connect(&registry).await;
        let t0 = now();
        registry.promote(c1, &s1, t0).await;
        drain(&mut rx_obs);

        // Not stale yet.
        assert!(registry.evict_stale(t0 - chrono::Duration::seconds(1), t0).await.is_empty());

        let later = t0 + chrono::Duration::seconds(400);
        let evicted = registry.evict_stale(t0 + chrono::Duration::seconds(1), later).await;
        assert_eq!(evicted, vec![(c1, s1.clone())]);
        assert!(!registry.is_online(&s1).await);

        let closes: Vec<_> = drain(&mut rx1)
            .into_iter()
            .filter(|o| matches!(o, Outbound::Close { .. }))
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(status_updates(&drain(&mut rx_obs)).len(), 1);
    }

    #[tokio::test]
    async fn test_evict_skips_unauthenticated() {
        let registry = test_registry();
        let (c1, _rx) = connect(&registry).await;

        let evicted = registry.evict_stale(now() + chrono::Duration::hours(1), now()).await;
        assert!(evicted.is_empty());
        assert_eq!(registry.state_of(&c1).await, ConnectionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_close_all_reports_stations() {
        let registry = test_registry();
        let (c1, _rx1) = connect(&registry).await;
        let (c2, _rx2) = connect(&registry).await;
        let (_c3, _rx3) = connect(&registry).await;
        registry.promote(c1, &StationId::new("S1"), now()).await;
        registry.promote(c2, &StationId::new("S2"), now()).await;

        let stations = registry.close_all(now()).await;
        assert_eq!(stations, vec![StationId::new("S1"), StationId::new("S2")]);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_persist_presence_writes_current_state() {
        let dir = Arc::new(InMemoryDirectory::with_stations([StationRow::new("S1", "North Depot")]));
        let client = DirectoryClient::new(dir.clone(), Duration::from_secs(1));
        let registry = test_registry();
        let s1 = StationId::new("S1");

        // Never seen: nothing to write.
        registry.persist_presence(&s1, &client).await.unwrap();
        assert_eq!(dir.write_count(), 0);

        let (c1, _rx) = connect(&registry).await;
        let t0 = now();
        registry.promote(c1, &s1, t0).await;
        registry.persist_presence(&s1, &client).await.unwrap();
        let row = dir.row(&s1).await.unwrap();
        assert!(row.is_online);
        assert_eq!(row.last_heartbeat, Some(t0));

        registry.unregister(c1, now()).await;
        registry.persist_presence(&s1, &client).await.unwrap();
        let row = dir.row(&s1).await.unwrap();
        assert!(!row.is_online);
        assert_eq!(row.last_heartbeat, Some(t0));
    }
}
