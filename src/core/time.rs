//! Wall-clock timestamps.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Timestamp type used on the wire and in the directory.
pub type Timestamp = DateTime<Utc>;

/// Current wall-clock time.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Convert a std duration into a chrono one, saturating at i64 millis.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(millis)
}

/// Clamp a client-reported time so it never runs ahead of the server clock.
pub fn clamp_to(reported: Timestamp, server_now: Timestamp) -> Timestamp {
    reported.min(server_now)
}
