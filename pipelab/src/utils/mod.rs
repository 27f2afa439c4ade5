//! Utility functions shared across the engine.

mod timestamps;

pub use timestamps::{
    format_iso8601, from_millis, now_utc, to_millis, Timestamp, TimestampError,
};
