//! Query functions over the shared state store, grouped by concern.

pub mod agents;
pub mod backoff;
pub mod dag;
pub mod instructions;
pub mod locks;
pub mod scheduler;
pub mod state;

use chrono::{DateTime, Utc};

/// Current wall clock in unix milliseconds, the unit used for TTL rows.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Serialize a timestamp for TEXT storage.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a TEXT timestamp written by [`encode_ts`].
pub(crate) fn decode_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
