//! Core data types for metadata queries
//!
//! This module defines the fundamental value types shared by every layer:
//!
//! - **`Timestamp`**: Absolute instant in milliseconds since the Unix epoch (UTC)
//! - **`TimeRange`**: Inclusive `[start, end]` window over timestamps
//! - **`Series`**: Series identity (key plus tag set) as stored in the metadata index

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Absolute instant, milliseconds since the Unix epoch, always UTC
pub type Timestamp = i64;

/// Milliseconds in one day
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Time range for queries (inclusive on both ends)
///
/// # Example
///
/// ```rust
/// use kuba_metadata::types::TimeRange;
///
/// let range = TimeRange::new(1000, 2000).unwrap();
/// assert!(range.contains(1000));
/// assert!(range.contains(2000));
/// assert!(!range.contains(2001));
/// assert_eq!(range.duration_ms(), Some(1000));
///
/// // Inverted ranges are rejected
/// assert!(TimeRange::new(2000, 1000).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp in milliseconds (inclusive)
    pub start: Timestamp,

    /// End timestamp in milliseconds (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range, rejecting `start > end`
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRangeFilter(format!(
                "inverted time range: start {} > end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Zero-width range at the current instant
    ///
    /// Used when writing series metadata, which is stamped with the time of
    /// the write rather than a caller supplied window.
    pub fn now() -> Self {
        Self::at(now_millis())
    }

    /// Zero-width range at `instant`
    pub fn at(instant: Timestamp) -> Self {
        Self {
            start: instant,
            end: instant,
        }
    }

    /// The `days`-long window ending at `now`
    ///
    /// The start saturates at `i64::MIN` rather than overflowing.
    pub fn last_days(now: Timestamp, days: i64) -> Self {
        Self {
            start: now.saturating_sub(days.saturating_mul(DAY_MS)),
            end: now,
        }
    }

    /// Check that `start <= end`
    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Check if a timestamp falls within this range (inclusive)
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// Check if two ranges share at least one instant
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Duration in milliseconds, `None` on overflow
    pub fn duration_ms(&self) -> Option<i64> {
        self.end.checked_sub(self.start)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Identity of a time series in the metadata index
///
/// A series is identified by its key together with its full tag set. Tags are
/// kept in a `BTreeMap` so that equality, ordering and hashing never depend on
/// insertion order.
///
/// # Example
///
/// ```rust
/// use kuba_metadata::types::Series;
///
/// let a = Series::new("cpu").with_tag("host", "a").with_tag("dc", "eu");
/// let b = Series::new("cpu").with_tag("dc", "eu").with_tag("host", "a");
///
/// assert_eq!(a, b);
/// assert_eq!(a.stable_hash(), b.stable_hash());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Series {
    /// Series key (metric name)
    pub key: String,

    /// Tag key-value pairs
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Series {
    /// Create a series with no tags
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Builder-style tag insertion
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Get a tag value
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Hash of the series identity that is stable across processes and builds
    ///
    /// FNV-1a over the key followed by every `key=value` pair in sorted order,
    /// with a separator byte between fields so that `("ab", "c")` and
    /// `("a", "bc")` hash differently. Write routing depends on every node
    /// computing the same value, which rules out `DefaultHasher`.
    pub fn stable_hash(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        let mut feed = |bytes: &[u8]| {
            for b in bytes.iter().chain(std::iter::once(&0xffu8)) {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(PRIME);
            }
        };

        feed(self.key.as_bytes());
        for (k, v) in &self.tags {
            feed(k.as_bytes());
            feed(v.as_bytes());
        }

        hash
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.key)?;
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(100, 200).unwrap();
        assert!(range.contains(150));
        assert!(!range.contains(50));
        assert!(!range.contains(250));
        assert_eq!(range.duration_ms(), Some(100));

        assert!(matches!(
            TimeRange::new(200, 100),
            Err(Error::InvalidRangeFilter(_))
        ));
    }

    #[test]
    fn test_time_range_overlaps() {
        let a = TimeRange::new(0, 100).unwrap();
        assert!(a.overlaps(&TimeRange::new(100, 200).unwrap()));
        assert!(a.overlaps(&TimeRange::new(-50, 0).unwrap()));
        assert!(!a.overlaps(&TimeRange::new(101, 200).unwrap()));
    }

    #[test]
    fn test_last_days() {
        let range = TimeRange::last_days(10 * DAY_MS, 7);
        assert_eq!(range.start, 3 * DAY_MS);
        assert_eq!(range.end, 10 * DAY_MS);

        let saturated = TimeRange::last_days(i64::MIN + 5, 7);
        assert_eq!(saturated.start, i64::MIN);
        assert!(saturated.is_valid());
    }

    #[test]
    fn test_series_identity_ignores_insertion_order() {
        let a = Series::new("cpu").with_tag("host", "a").with_tag("dc", "eu");
        let b = Series::new("cpu").with_tag("dc", "eu").with_tag("host", "a");
        assert_eq!(a, b);
        assert_eq!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn test_stable_hash_separates_fields() {
        let a = Series::new("ab").with_tag("c", "d");
        let b = Series::new("a").with_tag("bc", "d");
        assert_ne!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn test_series_display() {
        let s = Series::new("cpu").with_tag("host", "a").with_tag("dc", "eu");
        assert_eq!(s.to_string(), "cpu{dc=eu, host=a}");
    }
}
