//! Network Layer
//!
//! WebSocket transport for station connections.
//! Presence decisions live in `presence/`; this layer only moves frames.

pub mod auth;
pub mod protocol;
pub mod server;

pub use auth::{verify_station_credential, validate_token, AuthConfig, AuthError, TokenClaims};
pub use protocol::{ClientMessage, ErrorCode, ServerMessage, StationStatus};
pub use server::{ServerConfig, StationServer, StationServerError};
