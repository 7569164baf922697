//! # Station Presence Server
//!
//! Connection lifecycle and presence coordination for distributed station nodes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  STATION PRESENCE SERVER                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── ids.rs      - Connection / station identifiers          │
//! │  └── time.rs     - Wall-clock timestamps                     │
//! │                                                              │
//! │  directory/      - Station directory collaborator            │
//! │  ├── mod.rs      - Async trait + timeout-bounded client      │
//! │  └── memory.rs   - In-memory store (JSON seed)               │
//! │                                                              │
//! │  presence/       - Presence coordination                     │
//! │  ├── registry.rs - Connections + per-station refcounts       │
//! │  ├── gate.rs     - Authentication gate                       │
//! │  ├── heartbeat.rs- Heartbeat processing + staleness sweep    │
//! │  ├── broadcast.rs- Fan-out and presence announcements        │
//! │  ├── rooms.rs    - Station rooms                             │
//! │  └── hub.rs      - Composition root                          │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - Credential tokens (JWT)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Presence Guarantee
//!
//! A station is online exactly while at least one authenticated connection
//! is bound to it. Each 0→1 and 1→0 crossing is announced once, and peers
//! observe the transitions of any single station in the order they happened.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod directory;
pub mod network;
pub mod presence;

// Re-export commonly used types
pub use crate::core::{ConnectionId, ConnectionType, StationId, Timestamp};
pub use directory::{DirectoryClient, DirectoryError, InMemoryDirectory, StationDirectory, StationRecord};
pub use network::{ServerConfig, StationServer};
pub use presence::{PresenceConfig, PresenceError, PresenceHook, PresenceHub};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
