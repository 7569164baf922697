//! Core primitives.
//!
//! Identifiers and time handling used by the directory, presence
//! and network layers.

pub mod ids;
pub mod time;

// Re-export core types
pub use ids::{ConnectionId, ConnectionType, StationId, UnknownConnectionType};
pub use time::Timestamp;
