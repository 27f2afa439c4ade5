//! Timestamp helpers.
//!
//! Stores persist instants as Unix milliseconds; the public API works in
//! `DateTime<Utc>`.

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur converting timestamps.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    /// The millisecond value cannot be represented.
    #[error("Timestamp out of range: {0} ms")]
    OutOfRange(i64),
}

/// Returns the current UTC timestamp at millisecond precision.
///
/// Truncation keeps in-memory values equal to their stored form.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now().trunc_subsecs(3)
}

/// Formats a timestamp as ISO 8601 string.
#[must_use]
pub fn format_iso8601(dt: &Timestamp) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Converts a timestamp to Unix milliseconds.
#[must_use]
pub fn to_millis(dt: &Timestamp) -> i64 {
    dt.timestamp_millis()
}

/// Converts Unix milliseconds to a timestamp.
pub fn from_millis(ms: i64) -> Result<Timestamp, TimestampError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(TimestampError::OutOfRange(ms))
}
