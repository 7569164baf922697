//! Authentication Gate
//!
//! Validates an `authenticate` request against the station directory and
//! promotes the connection on success. Fails closed: if the directory cannot
//! be reached the connection stays unauthenticated and may retry.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::{ConnectionRegistry, PromoteOutcome};
use super::PresenceError;
use crate::core::{ConnectionId, StationId, Timestamp};
use crate::directory::DirectoryClient;
use crate::network::auth::{verify_station_credential, AuthConfig};

/// Successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// Bound station.
    pub station_id: StationId,
    /// Station display name from the directory.
    pub station_name: String,
    /// Server time of the promotion.
    pub timestamp: Timestamp,
    /// Whether this connection brought the station online.
    pub came_online: bool,
}

/// Gate between unauthenticated and authenticated connections.
pub struct AuthenticationGate {
    registry: Arc<ConnectionRegistry>,
    directory: DirectoryClient,
    auth: AuthConfig,
}

impl AuthenticationGate {
    /// Create a gate.
    pub fn new(registry: Arc<ConnectionRegistry>, directory: DirectoryClient, auth: AuthConfig) -> Self {
        Self {
            registry,
            directory,
            auth,
        }
    }

    /// Authenticate `connection` as `station`.
    pub async fn authenticate(
        &self,
        connection: ConnectionId,
        station: &StationId,
        token: Option<&str>,
        now: Timestamp,
    ) -> Result<Authenticated, PresenceError> {
        let current = self
            .registry
            .connection(&connection)
            .await
            .ok_or(PresenceError::ConnectionNotFound)?;
        if let Some(bound) = current.station_id.filter(|bound| bound != station) {
            return Err(PresenceError::AlreadyBound(bound.to_string()));
        }

        verify_station_credential(station, token, &self.auth).map_err(|err| {
            debug!(connection = %connection, station = %station, error = %err, "Credential rejected");
            PresenceError::from(err)
        })?;

        let record = self
            .directory
            .find_station(station)
            .await?
            .filter(|record| record.is_active)
            .ok_or(PresenceError::InvalidStation)?;

        let came_online = match self.registry.promote(connection, station, now).await {
            PromoteOutcome::Promoted { came_online } => came_online,
            PromoteOutcome::AlreadyBound(bound) if &bound == station => false,
            PromoteOutcome::AlreadyBound(bound) => return Err(PresenceError::AlreadyBound(bound.to_string())),
            PromoteOutcome::NotFound => return Err(PresenceError::ConnectionNotFound),
        };

        if let Err(err) = self.registry.persist_presence(station, &self.directory).await {
            warn!(station = %station, error = %err, "Failed to record station online");
        }

        info!(connection = %connection, station = %station, "Station authenticated");
        Ok(Authenticated {
            station_id: record.id,
            station_name: record.name,
            timestamp: now,
            came_online,
        })
    }
}
