//! General utilities.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, Utc};

/// Get current Unix timestamp in seconds.
///
/// When `LUMENFLOW_TEST_EPOCH` is set (by tests), returns that value instead
/// of the actual current time. This enables deterministic test assertions on
/// timestamps written into events, signals, and stamps.
///
/// All code that needs timestamps for storage should use this function rather
/// than `SystemTime::now()` directly.
pub fn get_now() -> u64 {
    std::env::var("LUMENFLOW_TEST_EPOCH")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock before Unix epoch")
                .as_secs()
        })
}

/// Current time as a `chrono` UTC datetime, honouring the test epoch override.
pub fn now_datetime() -> DateTime<Utc> {
    DateTime::from_timestamp(get_now() as i64, 0).expect("timestamp out of chrono range")
}

/// Format the current time as ISO 8601 (e.g., "2026-01-01T00:00:00Z").
pub fn now_iso8601() -> String {
    now_datetime().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Today's date in UTC, honouring the test epoch override.
pub fn today() -> NaiveDate {
    now_datetime().date_naive()
}

/// Truncate a commit subject to `max` characters on a char boundary.
///
/// Git has no hard subject limit but tooling downstream assumes one; the
/// engine applies this to every commit subject it generates.
pub fn truncate_subject(subject: &str, max: usize) -> String {
    if subject.chars().count() <= max {
        return subject.to_string();
    }
    subject.chars().take(max).collect()
}
