use std::time::Duration;

use time::OffsetDateTime;

/// Current wall-clock time as a Unix timestamp in seconds.
pub fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Whether `timestamp` lies within `window` of `now`, in either direction.
pub fn within_window(timestamp: i64, now: i64, window: Duration) -> bool {
    let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
    now.saturating_sub(timestamp).abs() <= window
}
