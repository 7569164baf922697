//! Protocol Messages
//!
//! Wire format for station-coordinator communication over WebSocket.
//! One JSON text frame per event, internally tagged by `type` with the
//! event name; payload fields are camelCase.

use serde::{Deserialize, Serialize};

use crate::core::{StationId, Timestamp};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from a station connection to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Bind this connection to a station.
    Authenticate(AuthenticateRequest),

    /// Liveness signal from an authenticated connection.
    Heartbeat(HeartbeatRequest),
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    /// Station to bind to.
    pub station_id: StationId,
    /// Optional credential token (JWT).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Heartbeat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// Station the sender claims to be bound to.
    pub station_id: StationId,
    /// Client-side send time.
    pub timestamp: Timestamp,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from the coordinator to connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Greeting sent on accept.
    Connected(ConnectedInfo),

    /// Authentication succeeded.
    Authenticated(AuthenticatedInfo),

    /// Authentication rejected.
    AuthError(ErrorPayload),

    /// Heartbeat accepted.
    HeartbeatAck(HeartbeatAckInfo),

    /// Heartbeat rejected.
    HeartbeatError(ErrorPayload),

    /// A station went online or offline.
    StationStatusUpdate(StationStatus),

    /// Frame could not be processed.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown(ShutdownInfo),
}

/// Greeting payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    /// Human-readable greeting.
    pub message: String,
    /// Server time of accept.
    pub timestamp: Timestamp,
}

/// Successful authentication payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedInfo {
    /// Bound station.
    pub station_id: StationId,
    /// Station display name.
    pub station_name: String,
    /// Server time of binding.
    pub timestamp: Timestamp,
}

/// Heartbeat acknowledgment payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckInfo {
    /// Station the heartbeat was applied to.
    pub station_id: StationId,
    /// Latest heartbeat timestamp on record for the connection.
    pub timestamp: Timestamp,
}

/// Presence transition payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationStatus {
    /// Station whose presence changed.
    pub station_id: StationId,
    /// New presence.
    pub is_online: bool,
    /// Time of the transition.
    pub timestamp: Timestamp,
}

/// Error payload for rejected requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable message.
    pub message: String,
}

impl ErrorPayload {
    /// Build from anything displayable.
    pub fn new(message: impl ToString) -> Self {
        Self { message: message.to_string() }
    }
}

/// Transport-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame was not a valid message.
    InvalidInput,
    /// Frame kind is not supported.
    Unsupported,
    /// Connection limit reached.
    ServerOverloaded,
}

/// Shutdown notice payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownInfo {
    /// Why the server is closing the connection.
    pub reason: String,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
