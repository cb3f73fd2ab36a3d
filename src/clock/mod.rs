use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of minutes in one day; the fixed length of an intensity curve.
pub const MINUTES_PER_DAY: usize = 1440;

/// Returns the whole Unix seconds of a timestamp (0 before the epoch).
pub fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Returns the whole Unix milliseconds of a timestamp (0 before the epoch).
pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Returns the minute of day [0, 1440) for a timestamp.
///
/// Intensity curves are indexed by this value, so all intensity lookups
/// wrap on a 24-hour cycle.
pub fn minute_of_day(t: SystemTime) -> usize {
    ((unix_seconds(t) / 60) as usize) % MINUTES_PER_DAY
}

/// Returns the absolute minute bucket (Unix seconds / 60) for a timestamp.
///
/// Delta accumulators are keyed by this bucket rather than wall time so
/// that replaying a canned record sequence stays deterministic.
pub fn minute_bucket(t: SystemTime) -> u64 {
    unix_seconds(t) / 60
}
