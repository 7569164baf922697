//! Station Directory
//!
//! The authoritative store of station identity and activity. The presence
//! layer only ever looks stations up by id and writes their online flag and
//! last heartbeat. Every call goes through [`DirectoryClient`], which bounds
//! it with a timeout so a slow store can never stall a connection handler.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::core::{StationId, Timestamp};

pub use memory::{InMemoryDirectory, StationRow};

/// Subset of a station row the presence layer reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationRecord {
    /// Station identifier.
    pub id: StationId,
    /// Display name.
    pub name: String,
    /// Inactive stations may not authenticate.
    pub is_active: bool,
}

/// Directory errors.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    /// Backing store refused or failed the request.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// Request did not complete within the configured bound.
    #[error("directory request timed out after {0:?}")]
    Timeout(Duration),

    /// Write targeted a station that does not exist.
    #[error("unknown station: {0}")]
    UnknownStation(StationId),

    /// Seed data could not be loaded.
    #[error("invalid seed data: {0}")]
    Seed(String),
}

/// The external station store.
#[async_trait]
pub trait StationDirectory: Send + Sync {
    /// Look a station up by id.
    async fn find_station_by_id(
        &self,
        id: &StationId,
    ) -> Result<Option<StationRecord>, DirectoryError>;

    /// Write the online flag and last heartbeat of a station.
    async fn set_online_and_heartbeat(
        &self,
        id: &StationId,
        is_online: bool,
        last_heartbeat: Timestamp,
    ) -> Result<(), DirectoryError>;
}

/// Timeout-bounded handle to a [`StationDirectory`].
#[derive(Clone)]
pub struct DirectoryClient {
    inner: Arc<dyn StationDirectory>,
    timeout: Duration,
}

impl DirectoryClient {
    /// Wrap a directory, bounding every call by `timeout`.
    pub fn new(inner: Arc<dyn StationDirectory>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Look a station up by id.
    pub async fn find_station(&self, id: &StationId) -> Result<Option<StationRecord>, DirectoryError> {
        match tokio::time::timeout(self.timeout, self.inner.find_station_by_id(id)).await {
            Ok(result) => result.inspect_err(|e| warn!(station = %id, "Directory lookup failed: {}", e)),
            Err(_) => {
                warn!(station = %id, "Directory lookup timed out after {:?}", self.timeout);
                Err(DirectoryError::Timeout(self.timeout))
            }
        }
    }

    /// Write presence columns for a station.
    pub async fn set_online_and_heartbeat(
        &self,
        id: &StationId,
        is_online: bool,
        last_heartbeat: Timestamp,
    ) -> Result<(), DirectoryError> {
        let call = self.inner.set_online_and_heartbeat(id, is_online, last_heartbeat);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.inspect_err(|e| warn!(station = %id, "Directory write failed: {}", e)),
            Err(_) => {
                warn!(station = %id, "Directory write timed out after {:?}", self.timeout);
                Err(DirectoryError::Timeout(self.timeout))
            }
        }
    }
}
