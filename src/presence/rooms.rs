//! Channel Multiplexer
//!
//! Groups connections by the station they are bound to ("rooms") so a
//! message can be addressed to one station's connections without a global
//! broadcast. Only the registry mutates it, and always while holding the
//! station's lock, so membership never diverges from the authenticated
//! bindings.

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

use crate::core::{ConnectionId, StationId};

/// Station id to member connections.
#[derive(Debug, Default)]
pub struct ChannelMultiplexer {
    rooms: RwLock<BTreeMap<StationId, BTreeSet<ConnectionId>>>,
}

impl ChannelMultiplexer {
    /// Empty multiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a station's room. Returns false if already a member.
    pub async fn join(&self, connection: ConnectionId, station: &StationId) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms.entry(station.clone()).or_default().insert(connection)
    }

    /// Remove a connection from a station's room. Returns false if it was not a member.
    pub async fn leave(&self, connection: ConnectionId, station: &StationId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(station) else {
            return false;
        };
        let removed = members.remove(&connection);
        if members.is_empty() {
            rooms.remove(station);
        }
        removed
    }

    /// Current members of a station's room.
    pub async fn members_of(&self, station: &StationId) -> BTreeSet<ConnectionId> {
        self.rooms.read().await.get(station).cloned().unwrap_or_default()
    }

    /// Number of non-empty rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
