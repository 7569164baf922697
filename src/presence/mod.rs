//! Presence Coordination
//!
//! Connection lifecycle and station presence:
//!
//! ```text
//!  accept ──► ConnectionRegistry ◄── AuthenticationGate ◄── authenticate
//!                  │    ▲                    │
//!                  │    └── HeartbeatMonitor ◄── heartbeat / sweep timer
//!                  ▼
//!     ChannelMultiplexer + PresenceBroadcaster ──► Publisher ──► outboxes
//! ```
//!
//! A station is online exactly while at least one authenticated connection
//! is bound to it. All refcount changes for a station happen under that
//! station's lock, and the 0↔1 crossings are announced under the same lock.

pub mod broadcast;
pub mod gate;
pub mod heartbeat;
pub mod hub;
pub mod registry;
pub mod rooms;

use std::time::Duration;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::network::auth::AuthError;

pub use broadcast::{FanOut, Outbound, Outbox, OutboxReceiver, PresenceBroadcaster, PresenceHook, Publisher};
pub use gate::{AuthenticationGate, Authenticated};
pub use heartbeat::{Eviction, HeartbeatMonitor};
pub use hub::PresenceHub;
pub use registry::{Connection, ConnectionRegistry, ConnectionState, PromoteOutcome, TouchOutcome};
pub use rooms::ChannelMultiplexer;

/// Errors surfaced at the connection boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// Unknown or inactive station.
    #[error("Invalid station ID or station inactive")]
    InvalidStation,

    /// Heartbeat from a connection not bound to the claimed station.
    #[error("Unauthorized heartbeat")]
    UnauthorizedHeartbeat,

    /// Directory timed out or failed.
    #[error("Station directory unavailable, please retry")]
    DirectoryUnavailable,

    /// Connection missed heartbeats past the staleness threshold.
    #[error("Connection heartbeat timed out")]
    StaleConnection,

    /// Credential token rejected.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Connection is already bound to a different station.
    #[error("Connection already bound to station {0}")]
    AlreadyBound(String),

    /// Connection is closed or was never registered.
    #[error("Connection not found")]
    ConnectionNotFound,
}

impl From<DirectoryError> for PresenceError {
    fn from(_: DirectoryError) -> Self {
        PresenceError::DirectoryUnavailable
    }
}

impl From<AuthError> for PresenceError {
    fn from(err: AuthError) -> Self {
        PresenceError::InvalidCredentials(err.to_string())
    }
}

/// Accepted range for the heartbeat interval.
const HEARTBEAT_INTERVAL_RANGE: (Duration, Duration) = (Duration::from_secs(1), Duration::from_secs(86_400));
/// Upper bound on the staleness multiple.
const MAX_STALE_AFTER_INTERVALS: u32 = 1_000;
/// Accepted range for the directory call bound.
const DIRECTORY_TIMEOUT_RANGE: (Duration, Duration) = (Duration::from_millis(10), Duration::from_secs(600));

/// Presence timing and fan-out policy.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often the staleness sweep runs.
    pub heartbeat_interval: Duration,
    /// Staleness threshold as a multiple of the interval.
    pub stale_after_intervals: u32,
    /// Bound on every directory call.
    pub directory_timeout: Duration,
    /// Skip the connection that caused a transition when announcing it.
    pub exclude_origin: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            stale_after_intervals: 5,
            directory_timeout: Duration::from_secs(5),
            exclude_origin: true,
        }
    }
}

impl PresenceConfig {
    /// Create config from environment variables, falling back to defaults.
    /// Out-of-range values are clamped, zero falls back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            heartbeat_interval: env_parse("HEARTBEAT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            stale_after_intervals: env_parse("STALE_AFTER_INTERVALS")
                .unwrap_or(defaults.stale_after_intervals),
            directory_timeout: env_parse("DIRECTORY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.directory_timeout),
            exclude_origin: std::env::var("BROADCAST_EXCLUDES_ORIGIN")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.exclude_origin),
        };
        config.sanitized()
    }

    /// Bring every timing value into its accepted range.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let (min_interval, max_interval) = HEARTBEAT_INTERVAL_RANGE;
        let (min_timeout, max_timeout) = DIRECTORY_TIMEOUT_RANGE;
        let heartbeat_interval = if self.heartbeat_interval.is_zero() {
            defaults.heartbeat_interval
        } else {
            self.heartbeat_interval.clamp(min_interval, max_interval)
        };
        let stale_after_intervals = match self.stale_after_intervals {
            0 => defaults.stale_after_intervals,
            n => n.min(MAX_STALE_AFTER_INTERVALS),
        };
        let directory_timeout = if self.directory_timeout.is_zero() {
            defaults.directory_timeout
        } else {
            self.directory_timeout.clamp(min_timeout, max_timeout)
        };
        Self {
            heartbeat_interval,
            stale_after_intervals,
            directory_timeout,
            ..self
        }
    }

    /// Age after which an authenticated connection is evicted.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(self.stale_after_intervals)
    }
}

/// Parse an environment variable, ignoring absent or malformed values.
pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
