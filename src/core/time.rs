//! Shared timestamp helpers for persisted envelopes.
//!
//! Every persisted timestamp is RFC3339 UTC. Event-log segments and
//! decision-packet filenames derive from a caller-supplied `now` so that
//! producers stay testable and deterministic.

use crate::core::error::LanekeeperError;
use chrono::{DateTime, SecondsFormat, Utc};

/// Current instant, RFC3339 UTC with seconds precision (e.g. `2026-02-10T00:00:00Z`).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Segment name for an event-log segment file: `YYYYMMDD-HHMMSS` in UTC.
pub fn segment_stamp(now: &DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S").to_string()
}

/// Filesystem-safe timestamp for artifact filenames: `YYYYMMDD_HHMMSSmmm`.
pub fn fs_safe_stamp(now: &DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S%3f").to_string()
}

/// Parse an RFC3339 timestamp, yielding a `Malformed` error on bad input.
pub fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, LanekeeperError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LanekeeperError::Malformed(format!("invalid RFC3339 timestamp '{}': {}", raw, e)))
}

/// Render a `DateTime<Utc>` the way every persisted document does.
pub fn to_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}
