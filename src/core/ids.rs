//! Identifiers
//!
//! Connection and station identities shared by every layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of one live transport session.
///
/// Assigned at accept time and never reused, so an id that is no longer
/// in the registry always refers to a closed connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex chars are plenty for log correlation.
        let s = self.0.simple().to_string();
        write!(f, "conn-{}", &s[..8])
    }
}

/// Identity of a station row in the directory.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    /// Wrap a raw station id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of client on the other end of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    /// Station-side node software.
    #[default]
    LocalNode,
    /// Operator desktop application.
    DesktopApp,
    /// Mobile application.
    MobileApp,
}

impl ConnectionType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::LocalNode => "local-node",
            ConnectionType::DesktopApp => "desktop-app",
            ConnectionType::MobileApp => "mobile-app",
        }
    }
}

impl FromStr for ConnectionType {
    type Err = UnknownConnectionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-node" => Ok(ConnectionType::LocalNode),
            "desktop-app" => Ok(ConnectionType::DesktopApp),
            "mobile-app" => Ok(ConnectionType::MobileApp),
            other => Err(UnknownConnectionType(other.to_string())),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unrecognized connection type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown connection type: {0}")]
pub struct UnknownConnectionType(pub String);
