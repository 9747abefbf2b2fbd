//! Time utilities for tenrol
//!
//! Temporary enrolment windows are stored as Unix-epoch seconds, matching the
//! host platform's own timestamps. Helpers here convert between those and
//! chrono types and compute the "time left" figures used in emails.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `TENROL_MOCK_TIME` environment variable can be set
//! to override the system time for all time-sensitive operations. This is useful
//! for exercising reminder and expiration sweeps without waiting days.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2025-09-15 08:00:00`)
//!
//! Example:
//! ```bash
//! TENROL_MOCK_TIME="2025-09-29 08:00:00" tenrold --config dev.toml
//! ```

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::sync::OnceLock;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "TENROL_MOCK_TIME";

/// Seconds in one day
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Cached mock time offset from the real time when the process started.
/// This allows mock time to advance naturally.
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[cfg_attr(not(debug_assertions), allow(dead_code))]
fn parse_mock_time(value: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").ok()?;
    Local.from_local_datetime(&naive).single()
}

#[allow(clippy::disallowed_methods)] // This is the internal implementation that wraps Local::now()
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            if let Ok(mock_time_str) = std::env::var(MOCK_TIME_ENV_VAR) {
                match parse_mock_time(&mock_time_str) {
                    Some(mock_dt) => {
                        let offset = mock_dt.signed_duration_since(chrono::Local::now());
                        tracing::info!(
                            mock_time = %mock_time_str,
                            offset_secs = offset.num_seconds(),
                            "Mock time enabled"
                        );
                        return Some(offset);
                    }
                    None => {
                        tracing::warn!(
                            mock_time = %mock_time_str,
                            expected_format = "%Y-%m-%d %H:%M:%S",
                            "Invalid mock time"
                        );
                    }
                }
            }
            None
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Get the current local time, respecting mock time settings in debug builds.
#[allow(clippy::disallowed_methods)] // This is the wrapper that provides mock time support
pub fn now() -> DateTime<Local> {
    let real_now = chrono::Local::now();

    if let Some(offset) = get_mock_time_offset() {
        real_now + offset
    } else {
        real_now
    }
}

/// Current time as Unix-epoch seconds
pub fn unix_now() -> i64 {
    now().timestamp()
}

/// Convert Unix seconds to a local datetime for display
pub fn from_unix(secs: i64) -> Option<DateTime<Local>> {
    Local.timestamp_opt(secs, 0).single()
}

/// Format Unix seconds as `YYYY-MM-DD HH:MM:SS` local time
pub fn format_unix(secs: i64) -> String {
    from_unix(secs)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Whole days left until `time_end`, rounded half away from zero.
///
/// Negative once the window has passed.
pub fn days_left(time_end: i64, now: i64) -> i64 {
    (time_end.saturating_sub(now) as f64 / SECONDS_PER_DAY as f64).round() as i64
}

/// Whole minutes left until `time_end`, rounded half away from zero.
pub fn minutes_left(time_end: i64, now: i64) -> i64 {
    (time_end.saturating_sub(now) as f64 / 60.0).round() as i64
}
