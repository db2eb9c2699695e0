//! Temporal literal resolution
//!
//! Turns the text a user types for a range bound into an absolute instant.
//! Rules are tried in a fixed order:
//!
//! 1. `+N` / `-N`: offset of `N` milliseconds from `now`
//! 2. `N`: raw epoch milliseconds
//! 3. `yyyy-MM-dd/HH:mm[:ss[.SSS]]`: full date-time (contains `/`)
//! 4. `HH:mm[:ss[.SSS]]`: time of day on the UTC calendar date of `now`
//!
//! The fraction of a second takes one to nine digits and is truncated to
//! milliseconds, so `.5` and `.500` are the same instant.
//!
//! All calendar arithmetic is proleptic Gregorian in UTC. The host timezone
//! never participates, so every node resolves a literal to the same instant.
//!
//! # Example
//!
//! ```rust
//! use kuba_metadata::time::resolve_instant;
//!
//! let now = 1_622_538_930_500; // 2021-06-01T09:15:30.500Z
//!
//! assert_eq!(resolve_instant("-1000", now).unwrap(), now - 1000);
//! assert_eq!(resolve_instant("1234", now).unwrap(), 1234);
//! assert_eq!(resolve_instant("2021-06-01/09:15:30.500", 0).unwrap(), now);
//! assert_eq!(resolve_instant("09:15:30.500", now).unwrap(), now);
//! assert!(resolve_instant("not-a-time", now).is_err());
//! ```

use crate::error::{Error, Result};
use crate::types::{TimeRange, Timestamp};
use chrono::{DateTime, NaiveDateTime, NaiveTime};

/// Default look-back window when a range bound is omitted
pub const DEFAULT_RANGE_DAYS: i64 = 7;

/// Full date-time patterns, most specific first
const FULL_PATTERNS: [&str; 3] = [
    "%Y-%m-%d/%H:%M:%S%.f",
    "%Y-%m-%d/%H:%M:%S",
    "%Y-%m-%d/%H:%M",
];

/// Time-of-day patterns, most specific first
const TODAY_PATTERNS: [&str; 3] = ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"];

/// Resolve a temporal literal against `now`
pub fn resolve_instant(text: &str, now: Timestamp) -> Result<Timestamp> {
    let invalid = || Error::InvalidInstantLiteral(text.to_string());

    if let Some(offset) = text.strip_prefix('+') {
        let offset = parse_offset(offset).ok_or_else(invalid)?;
        return now.checked_add(offset).ok_or_else(invalid);
    }

    if let Some(offset) = text.strip_prefix('-') {
        let offset = parse_offset(offset).ok_or_else(invalid)?;
        return now.checked_sub(offset).ok_or_else(invalid);
    }

    if let Ok(millis) = text.parse::<i64>() {
        return Ok(millis);
    }

    if text.contains('/') {
        return parse_full(text).ok_or_else(invalid);
    }

    parse_today(text, now).ok_or_else(invalid)
}

/// Resolve optional start/end literals into a range
///
/// Missing bounds fall back to the [`DEFAULT_RANGE_DAYS`] window ending at
/// `now`. The resulting range must not be inverted.
pub fn resolve_range(
    start: Option<&str>,
    end: Option<&str>,
    now: Timestamp,
) -> Result<TimeRange> {
    let default = TimeRange::last_days(now, DEFAULT_RANGE_DAYS);

    let start = match start {
        Some(text) => resolve_instant(text, now)?,
        None => default.start,
    };
    let end = match end {
        Some(text) => resolve_instant(text, now)?,
        None => default.end,
    };

    TimeRange::new(start, end)
}

/// Render a nanosecond duration with a human unit
///
/// ```rust
/// use kuba_metadata::time::format_time_nanos;
///
/// assert_eq!(format_time_nanos(999), "999 ns");
/// assert_eq!(format_time_nanos(1_500), "1.500 us");
/// assert_eq!(format_time_nanos(2_250_000), "2.250 ms");
/// assert_eq!(format_time_nanos(3_000_000_000), "3.000 s");
/// ```
pub fn format_time_nanos(nanos: u64) -> String {
    if nanos < 1_000 {
        return format!("{} ns", nanos);
    }

    if nanos < 1_000_000 {
        return format!("{:.3} us", nanos as f64 / 1_000.0);
    }

    if nanos < 1_000_000_000 {
        return format!("{:.3} ms", nanos as f64 / 1_000_000.0);
    }

    format!("{:.3} s", nanos as f64 / 1_000_000_000.0)
}

/// Offsets are unsigned digit strings; a second sign is not accepted
fn parse_offset(digits: &str) -> Option<i64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn parse_full(text: &str) -> Option<Timestamp> {
    FULL_PATTERNS.iter().find_map(|pattern| {
        NaiveDateTime::parse_from_str(text, pattern)
            .ok()
            .map(|dt| dt.and_utc().timestamp_millis())
    })
}

fn parse_today(text: &str, now: Timestamp) -> Option<Timestamp> {
    let today = DateTime::from_timestamp_millis(now)?.date_naive();

    TODAY_PATTERNS.iter().find_map(|pattern| {
        NaiveTime::parse_from_str(text, pattern)
            .ok()
            .map(|time| today.and_time(time).and_utc().timestamp_millis())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    /// 2021-06-01T09:15:30.500Z
    const NOW: Timestamp = 1_622_538_930_500;

    fn utc_millis(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, ms: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_milli_opt(h, mi, s, ms)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    #[test]
    fn test_relative_offsets() {
        assert_eq!(resolve_instant("+1000", NOW).unwrap(), NOW + 1000);
        assert_eq!(resolve_instant("-1000", NOW).unwrap(), NOW - 1000);
        assert_eq!(resolve_instant("+0", NOW).unwrap(), NOW);
    }

    #[test]
    fn test_relative_offset_rejects_garbage() {
        assert!(resolve_instant("+", NOW).is_err());
        assert!(resolve_instant("-abc", NOW).is_err());
        assert!(resolve_instant("+-5", NOW).is_err());
        assert!(resolve_instant("--5", NOW).is_err());
    }

    #[test]
    fn test_relative_offset_overflow() {
        let err = resolve_instant("+1", i64::MAX).unwrap_err();
        assert!(matches!(err, Error::InvalidInstantLiteral(ref t) if t == "+1"));
        assert!(resolve_instant("-1", i64::MIN).is_err());
    }

    #[test]
    fn test_epoch_millis() {
        assert_eq!(resolve_instant("0", NOW).unwrap(), 0);
        assert_eq!(resolve_instant("1622538930500", 0).unwrap(), NOW);
    }

    #[test]
    fn test_full_date_time_specificity() {
        assert_eq!(
            resolve_instant("2021-06-01/09:15:30.500", 0).unwrap(),
            utc_millis(2021, 6, 1, 9, 15, 30, 500)
        );
        assert_eq!(
            resolve_instant("2021-06-01/09:15:30", 0).unwrap(),
            utc_millis(2021, 6, 1, 9, 15, 30, 0)
        );
        assert_eq!(
            resolve_instant("2021-06-01/09:15", 0).unwrap(),
            utc_millis(2021, 6, 1, 9, 15, 0, 0)
        );
    }

    #[test]
    fn test_full_date_time_independent_of_now() {
        let a = resolve_instant("2021-06-01/09:15:30.500", 0).unwrap();
        let b = resolve_instant("2021-06-01/09:15:30.500", NOW * 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, NOW);
    }

    #[test]
    fn test_full_date_time_rejects_invalid_calendar() {
        assert!(resolve_instant("2021-02-30/10:00", NOW).is_err());
        assert!(resolve_instant("2021-06-01/25:00", NOW).is_err());
        assert!(resolve_instant("2021/06/01", NOW).is_err());
    }

    #[test]
    fn test_today_time_of_day() {
        let resolved = resolve_instant("14:30", NOW).unwrap();
        assert_eq!(resolved, utc_millis(2021, 6, 1, 14, 30, 0, 0));

        let dt = DateTime::from_timestamp_millis(resolved).unwrap();
        assert_eq!(
            dt.date_naive(),
            DateTime::from_timestamp_millis(NOW).unwrap().date_naive()
        );
        assert_eq!(dt.hour(), 14);
        assert_eq!(dt.minute(), 30);
        assert_eq!(dt.second(), 0);
    }

    #[test]
    fn test_today_with_seconds_and_fraction() {
        assert_eq!(
            resolve_instant("00:00:01", NOW).unwrap(),
            utc_millis(2021, 6, 1, 0, 0, 1, 0)
        );
        assert_eq!(
            resolve_instant("23:59:59.999", NOW).unwrap(),
            utc_millis(2021, 6, 1, 23, 59, 59, 999)
        );
    }

    #[test]
    fn test_fraction_digit_counts() {
        let half = utc_millis(2021, 6, 1, 9, 15, 30, 500);
        assert_eq!(resolve_instant("09:15:30.5", NOW).unwrap(), half);
        assert_eq!(resolve_instant("09:15:30.50", NOW).unwrap(), half);
        assert_eq!(resolve_instant("2021-06-01/09:15:30.5", 0).unwrap(), half);
        assert_eq!(resolve_instant("2021-06-01/09:15:30.50", 0).unwrap(), half);

        // sub-millisecond digits are truncated, not rounded
        assert_eq!(
            resolve_instant("09:15:30.123999999", NOW).unwrap(),
            utc_millis(2021, 6, 1, 9, 15, 30, 123)
        );
        assert!(resolve_instant("09:15:30.", NOW).is_err());
    }

    #[test]
    fn test_today_before_epoch() {
        // 1969-12-31T12:00:00Z
        let now = -12 * 60 * 60 * 1000;
        assert_eq!(
            resolve_instant("06:00", now).unwrap(),
            utc_millis(1969, 12, 31, 6, 0, 0, 0)
        );
    }

    #[test]
    fn test_unparseable_literals() {
        for text in ["not-a-time", "", "14:3x", "1.5", "yesterday", "2021-06-01"] {
            let err = resolve_instant(text, NOW).unwrap_err();
            assert!(
                matches!(err, Error::InvalidInstantLiteral(ref t) if t == text),
                "expected InvalidInstantLiteral for {:?}, got {:?}",
                text,
                err
            );
        }
    }

    #[test]
    fn test_resolve_range_defaults() {
        let range = resolve_range(None, None, NOW).unwrap();
        assert_eq!(range.end, NOW);
        assert_eq!(range.start, NOW - 7 * crate::types::DAY_MS);

        let range = resolve_range(Some("-1000"), None, NOW).unwrap();
        assert_eq!(range, TimeRange::new(NOW - 1000, NOW).unwrap());
    }

    #[test]
    fn test_resolve_range_rejects_inversion() {
        let err = resolve_range(Some("+10"), Some("-10"), NOW).unwrap_err();
        assert!(matches!(err, Error::InvalidRangeFilter(_)));
    }

    #[test]
    fn test_format_time_nanos() {
        assert_eq!(format_time_nanos(0), "0 ns");
        assert_eq!(format_time_nanos(1_000), "1.000 us");
        assert_eq!(format_time_nanos(999_999), "999.999 us");
        assert_eq!(format_time_nanos(1_000_000_000), "1.000 s");
    }
}
