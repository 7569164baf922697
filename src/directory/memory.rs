//! In-memory station directory.
//!
//! Backs the binary when no external store is wired in, and doubles as the
//! test double for the presence layer: availability and latency can be
//! toggled at runtime to exercise the fail-closed paths.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::{DirectoryError, StationDirectory, StationRecord};
use crate::core::{StationId, Timestamp};

/// A station row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationRow {
    /// Station identifier.
    pub id: StationId,
    /// Display name.
    pub name: String,
    /// Whether the station may authenticate.
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Presence flag maintained by the coordinator.
    #[serde(default)]
    pub is_online: bool,
    /// Last heartbeat written by the coordinator.
    #[serde(default)]
    pub last_heartbeat: Option<Timestamp>,
}

fn default_active() -> bool {
    true
}

impl StationRow {
    /// An active, offline station.
    pub fn new(id: impl Into<StationId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_active: true,
            is_online: false,
            last_heartbeat: None,
        }
    }

    /// Same row, marked inactive.
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Directory held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    rows: RwLock<BTreeMap<StationId, StationRow>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    writes: AtomicUsize,
}

impl InMemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory seeded with the given rows.
    pub fn with_stations(rows: impl IntoIterator<Item = StationRow>) -> Self {
        let rows = rows.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            rows: RwLock::new(rows),
            ..Default::default()
        }
    }

    /// Load rows from a JSON array on disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DirectoryError::Seed(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Load rows from a JSON array.
    pub fn from_json(text: &str) -> Result<Self, DirectoryError> {
        let rows: Vec<StationRow> =
            serde_json::from_str(text).map_err(|e| DirectoryError::Seed(e.to_string()))?;
        Ok(Self::with_stations(rows))
    }

    /// Toggle availability; while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Artificial delay applied before every call.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Snapshot of a row.
    pub async fn row(&self, id: &StationId) -> Option<StationRow> {
        self.rows.read().await.get(id).cloned()
    }

    /// Number of station rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// True if the directory holds no stations.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Number of successful presence writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> Result<(), DirectoryError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StationDirectory for InMemoryDirectory {
    async fn find_station_by_id(
        &self,
        id: &StationId,
    ) -> Result<Option<StationRecord>, DirectoryError> {
        self.simulate().await?;
        let rows = self.rows.read().await;
        Ok(rows.get(id).map(|row| StationRecord {
            id: row.id.clone(),
            name: row.name.clone(),
            is_active: row.is_active,
        }))
    }

    async fn set_online_and_heartbeat(
        &self,
        id: &StationId,
        is_online: bool,
        last_heartbeat: Timestamp,
    ) -> Result<(), DirectoryError> {
        self.simulate().await?;
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| DirectoryError::UnknownStation(id.clone()))?;
        row.is_online = is_online;
        row.last_heartbeat = Some(last_heartbeat);
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(station = %id, is_online, "Directory row updated");
        Ok(())
    }
}
