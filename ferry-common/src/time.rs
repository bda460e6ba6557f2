//! Wall-clock helpers. Persisted timestamps are whole seconds since the Unix
//! epoch so they survive restarts and serialize compactly.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Seconds since the Unix epoch, or zero if the clock is before it.
#[must_use]
pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

fn to_datetime(epoch_secs: u64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(i64::try_from(epoch_secs).ok()?, 0)
}

/// Human readable UTC rendering, used in logs and listings.
#[must_use]
pub fn format_epoch(epoch_secs: u64) -> String {
    to_datetime(epoch_secs).map_or_else(
        || "unknown".to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

/// RFC 2822 rendering, as required by mail headers.
#[must_use]
pub fn rfc2822(epoch_secs: u64) -> String {
    to_datetime(epoch_secs).map_or_else(|| "unknown".to_string(), |dt| dt.to_rfc2822())
}
