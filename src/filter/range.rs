//! Range filter envelope
//!
//! A [`RangeFilter`] is the single unit of work handed to the dispatch layer:
//! a filter tree, an inclusive time range and an optional result limit that is
//! pushed down to every shard.

use super::FilterExpression;
use crate::error::{Error, Result};
use crate::types::TimeRange;
use serde::Serialize;

/// Filter, time range and optional limit
///
/// Fields are private; a `RangeFilter` can only be obtained through the
/// validating constructors, so `range.start <= range.end` and `limit > 0`
/// always hold.
///
/// # Example
///
/// ```rust
/// use kuba_metadata::filter::{FilterExpression, RangeFilter};
/// use kuba_metadata::types::TimeRange;
///
/// let range = TimeRange::new(0, 1000).unwrap();
/// let rf = RangeFilter::new(FilterExpression::AlwaysTrue, range, Some(10)).unwrap();
/// assert_eq!(rf.limit(), Some(10));
///
/// assert!(RangeFilter::new(FilterExpression::AlwaysTrue, range, Some(0)).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RangeFilter {
    filter: FilterExpression,
    range: TimeRange,
    limit: Option<usize>,
}

impl RangeFilter {
    /// Create a validated range filter
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRangeFilter`] if the range is inverted or the
    /// limit is zero.
    pub fn new(filter: FilterExpression, range: TimeRange, limit: Option<usize>) -> Result<Self> {
        if !range.is_valid() {
            return Err(Error::InvalidRangeFilter(format!(
                "inverted time range {}",
                range
            )));
        }
        if limit == Some(0) {
            return Err(Error::InvalidRangeFilter(
                "limit must be positive".to_string(),
            ));
        }

        Ok(Self {
            filter,
            range,
            limit,
        })
    }

    /// Range filter without a limit
    pub fn filter_for(filter: FilterExpression, range: TimeRange) -> Result<Self> {
        Self::new(filter, range, None)
    }

    /// Build from a signed limit as carried by request bodies
    ///
    /// Non-positive limits are rejected.
    pub fn with_signed_limit(
        filter: FilterExpression,
        range: TimeRange,
        limit: Option<i64>,
    ) -> Result<Self> {
        let limit = match limit {
            None => None,
            Some(n) if n <= 0 => {
                return Err(Error::InvalidRangeFilter(format!(
                    "limit must be positive, got {}",
                    n
                )))
            }
            Some(n) => Some(usize::try_from(n).unwrap_or(usize::MAX)),
        };
        Self::new(filter, range, limit)
    }

    /// Copy with a different limit
    pub fn with_limit(&self, limit: Option<usize>) -> Result<Self> {
        Self::new(self.filter.clone(), self.range, limit)
    }

    /// Filter tree
    pub fn filter(&self) -> &FilterExpression {
        &self.filter
    }

    /// Time range
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Result limit pushed to shards
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Same envelope with the filter in normal form
    pub fn normalized(&self) -> Self {
        Self {
            filter: self.filter.optimize(),
            range: self.range,
            limit: self.limit,
        }
    }

    /// Stable text form of the normalized envelope, used for fingerprints
    pub fn canonical(&self) -> String {
        let limit = match self.limit {
            Some(n) => n.to_string(),
            None => "none".to_string(),
        };
        format!(
            "filter={} range={} limit={}",
            self.filter.optimize(),
            self.range,
            limit
        )
    }

    /// Truncate a merged result set to the limit
    pub fn truncate<T>(&self, items: &mut Vec<T>) -> bool {
        match self.limit {
            Some(limit) if items.len() > limit => {
                items.truncate(limit);
                true
            }
            _ => false,
        }
    }
}
