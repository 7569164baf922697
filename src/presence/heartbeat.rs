//! Heartbeat Monitor
//!
//! Applies liveness timestamps from `heartbeat` messages and periodically
//! sweeps for authenticated connections that have gone quiet. A stale
//! connection is evicted exactly as if it had disconnected.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::{ConnectionRegistry, TouchOutcome};
use super::PresenceError;
use crate::core::time::{self, clamp_to, to_chrono};
use crate::core::{ConnectionId, StationId, Timestamp};
use crate::directory::DirectoryClient;

/// Shortest period the sweeper will tick at.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// A connection removed by the staleness sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// Evicted connection.
    pub connection_id: ConnectionId,
    /// Station it was bound to.
    pub station_id: StationId,
}

/// Inline heartbeat handling and the background staleness sweep.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    directory: DirectoryClient,
    interval: Duration,
    stale_after: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor sweeping every `interval`, evicting after `stale_after`.
    /// A zero interval is raised to the minimum sweep period.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: DirectoryClient,
        interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            registry,
            directory,
            interval: interval.max(MIN_SWEEP_PERIOD),
            stale_after,
        }
    }

    /// Handle a heartbeat claiming `station`, received at server time `now`.
    /// Returns the heartbeat timestamp on record afterwards: the reported one
    /// clamped to the server clock, or the newer one already stored.
    ///
    /// A mismatched or unauthenticated sender changes nothing. A directory
    /// failure is reported but the in-memory liveness update stands.
    pub async fn process(
        &self,
        connection: ConnectionId,
        station: &StationId,
        reported: Timestamp,
        now: Timestamp,
    ) -> Result<Timestamp, PresenceError> {
        match self.registry.binding(&connection).await {
            Some(bound) if &bound == station => {}
            bound => {
                debug!(
                    connection = %connection,
                    claimed = %station,
                    bound = ?bound.as_ref().map(StationId::as_str),
                    "Heartbeat rejected"
                );
                return Err(PresenceError::UnauthorizedHeartbeat);
            }
        }

        let at = clamp_to(reported, now);
        let outcome = self.registry.touch_heartbeat(connection, at, now).await?;
        if outcome == TouchOutcome::Updated {
            self.registry.persist_presence(station, &self.directory).await?;
        }
        Ok(outcome.stored(at))
    }

    /// Evict every connection not heard from within the threshold, measured
    /// on the server clock.
    pub async fn sweep(&self, now: Timestamp) -> Vec<Eviction> {
        let Some(cutoff) = now.checked_sub_signed(to_chrono(self.stale_after)) else {
            // Threshold reaches past the earliest representable time.
            return Vec::new();
        };
        let evicted = self.registry.evict_stale(cutoff, now).await;

        for (connection, station) in &evicted {
            warn!(connection = %connection, station = %station, "Evicted stale connection");
            if let Err(err) = self.registry.persist_presence(station, &self.directory).await {
                warn!(station = %station, error = %err, "Failed to record station offline");
            }
        }

        evicted
            .into_iter()
            .map(|(connection_id, station_id)| Eviction {
                connection_id,
                station_id,
            })
            .collect()
    }

    /// Run the sweep on its interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep(time::now()).await;
                        if !evicted.is_empty() {
                            info!(count = evicted.len(), "Staleness sweep evicted connections");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Heartbeat sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}
