//! Operation kinds and dispatchable queries

use crate::filter::RangeFilter;
use crate::types::{Series, TimeRange};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every operation the cluster understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Tag keys and values
    FindTags,
    /// Distinct series keys
    FindKeys,
    /// Series identities
    FindSeries,
    /// Number of matching series
    CountSeries,
    /// Remove matching series
    DeleteSeries,
    /// Tag keys ranked by series count
    TagKeyCount,
    /// Scored series key completion
    KeySuggest,
    /// Scored tag key/value completion
    TagSuggest,
    /// Values of one tag key
    TagValueSuggest,
    /// Values grouped by tag key
    TagValuesSuggest,
    /// Register one series on its owning shard
    WriteSeries,
}

impl OperationKind {
    /// Stable name used in logs, metrics and fingerprints
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::FindTags => "find_tags",
            OperationKind::FindKeys => "find_keys",
            OperationKind::FindSeries => "find_series",
            OperationKind::CountSeries => "count_series",
            OperationKind::DeleteSeries => "delete_series",
            OperationKind::TagKeyCount => "tag_key_count",
            OperationKind::KeySuggest => "key_suggest",
            OperationKind::TagSuggest => "tag_suggest",
            OperationKind::TagValueSuggest => "tag_value_suggest",
            OperationKind::TagValuesSuggest => "tag_values_suggest",
            OperationKind::WriteSeries => "write_series",
        }
    }

    /// Read-mostly operations served through the deduplicating cache
    pub const fn is_cacheable(&self) -> bool {
        matches!(
            self,
            OperationKind::FindTags
                | OperationKind::FindKeys
                | OperationKind::TagKeyCount
                | OperationKind::KeySuggest
                | OperationKind::TagSuggest
                | OperationKind::TagValueSuggest
                | OperationKind::TagValuesSuggest
        )
    }

    /// Whether a caller may opt into partial results
    ///
    /// Delete and write are always strict.
    pub const fn allows_partial(&self) -> bool {
        !matches!(self, OperationKind::DeleteSeries | OperationKind::WriteSeries)
    }

    /// Whether the operation changes shard state
    pub const fn is_mutation(&self) -> bool {
        matches!(self, OperationKind::DeleteSeries | OperationKind::WriteSeries)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text matching knobs for key and tag suggestions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchOptions {
    /// Allow approximate matches
    #[serde(default = "default_fuzzy")]
    pub fuzzy: bool,

    /// Leading characters that must match exactly for a fuzzy hit
    #[serde(default = "default_prefix_length")]
    pub prefix_length: usize,

    /// Maximum fuzzy hits per shard
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,
}

fn default_fuzzy() -> bool {
    true
}

fn default_prefix_length() -> usize {
    2
}

fn default_max_expansions() -> usize {
    20
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            fuzzy: default_fuzzy(),
            prefix_length: default_prefix_length(),
            max_expansions: default_max_expansions(),
        }
    }
}

/// A fully resolved request ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataQuery {
    /// Tag keys and values of matching series
    FindTags(RangeFilter),
    /// Distinct keys of matching series
    FindKeys(RangeFilter),
    /// Matching series
    FindSeries(RangeFilter),
    /// Count of matching series
    CountSeries(RangeFilter),
    /// Delete matching series on every shard
    DeleteSeries(RangeFilter),
    /// Tag key counts over matching series
    TagKeyCount(RangeFilter),
    /// Series key suggestions
    KeySuggest {
        /// Series to draw suggestions from
        filter: RangeFilter,
        /// Text matching knobs
        options: MatchOptions,
        /// Partial key typed so far
        key: Option<String>,
    },
    /// Tag suggestions
    TagSuggest {
        /// Series to draw suggestions from
        filter: RangeFilter,
        /// Text matching knobs
        options: MatchOptions,
        /// Partial tag key
        key: Option<String>,
        /// Partial tag value
        value: Option<String>,
    },
    /// Values of a single tag key
    TagValueSuggest {
        /// Series to draw values from
        filter: RangeFilter,
        /// Tag key; all keys when absent
        key: Option<String>,
    },
    /// Values grouped by tag key
    TagValuesSuggest {
        /// Series to draw values from
        filter: RangeFilter,
        /// Tag keys left out of the answer
        exclude: Vec<String>,
        /// Values kept per key
        group_limit: usize,
    },
    /// Register a series for a time range
    WriteSeries {
        /// Range the series is active in
        range: TimeRange,
        /// Series identity
        series: Series,
    },
}

impl MetadataQuery {
    /// Operation kind of this query
    pub fn kind(&self) -> OperationKind {
        match self {
            MetadataQuery::FindTags(_) => OperationKind::FindTags,
            MetadataQuery::FindKeys(_) => OperationKind::FindKeys,
            MetadataQuery::FindSeries(_) => OperationKind::FindSeries,
            MetadataQuery::CountSeries(_) => OperationKind::CountSeries,
            MetadataQuery::DeleteSeries(_) => OperationKind::DeleteSeries,
            MetadataQuery::TagKeyCount(_) => OperationKind::TagKeyCount,
            MetadataQuery::KeySuggest { .. } => OperationKind::KeySuggest,
            MetadataQuery::TagSuggest { .. } => OperationKind::TagSuggest,
            MetadataQuery::TagValueSuggest { .. } => OperationKind::TagValueSuggest,
            MetadataQuery::TagValuesSuggest { .. } => OperationKind::TagValuesSuggest,
            MetadataQuery::WriteSeries { .. } => OperationKind::WriteSeries,
        }
    }

    /// The range filter, absent only for writes
    pub fn range_filter(&self) -> Option<&RangeFilter> {
        match self {
            MetadataQuery::FindTags(f)
            | MetadataQuery::FindKeys(f)
            | MetadataQuery::FindSeries(f)
            | MetadataQuery::CountSeries(f)
            | MetadataQuery::DeleteSeries(f)
            | MetadataQuery::TagKeyCount(f) => Some(f),
            MetadataQuery::KeySuggest { filter, .. }
            | MetadataQuery::TagSuggest { filter, .. }
            | MetadataQuery::TagValueSuggest { filter, .. }
            | MetadataQuery::TagValuesSuggest { filter, .. } => Some(filter),
            MetadataQuery::WriteSeries { .. } => None,
        }
    }

    /// Stable text identity of the normalized query
    ///
    /// Equal for queries that differ only in filter child order or redundant
    /// nesting. Exclusion sets are compared as sets.
    pub fn canonical(&self) -> String {
        let mut out = String::from(self.kind().as_str());
        if let Some(filter) = self.range_filter() {
            out.push(' ');
            out.push_str(&filter.canonical());
        }

        match self {
            MetadataQuery::KeySuggest { options, key, .. } => {
                out.push_str(&format!(" match={} key={:?}", match_canonical(options), key));
            }
            MetadataQuery::TagSuggest {
                options,
                key,
                value,
                ..
            } => {
                out.push_str(&format!(
                    " match={} key={:?} value={:?}",
                    match_canonical(options),
                    key,
                    value
                ));
            }
            MetadataQuery::TagValueSuggest { key, .. } => {
                out.push_str(&format!(" key={:?}", key));
            }
            MetadataQuery::TagValuesSuggest {
                exclude,
                group_limit,
                ..
            } => {
                let mut exclude: Vec<&String> = exclude.iter().collect();
                exclude.sort();
                exclude.dedup();
                out.push_str(&format!(" exclude={:?} group_limit={}", exclude, group_limit));
            }
            MetadataQuery::WriteSeries { range, series } => {
                out.push_str(&format!(" range={} series={}", range, series));
            }
            _ => {}
        }

        out
    }
}

fn match_canonical(options: &MatchOptions) -> String {
    format!(
        "fuzzy:{}/prefix:{}/expansions:{}",
        options.fuzzy, options.prefix_length, options.max_expansions
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterExpression;

    fn rf(filter: FilterExpression) -> RangeFilter {
        RangeFilter::filter_for(filter, TimeRange::new(0, 10).unwrap()).unwrap()
    }

    #[test]
    fn test_cacheable_and_strict_kinds() {
        assert!(OperationKind::FindTags.is_cacheable());
        assert!(OperationKind::TagKeyCount.is_cacheable());
        assert!(!OperationKind::FindSeries.is_cacheable());
        assert!(!OperationKind::CountSeries.is_cacheable());
        assert!(!OperationKind::DeleteSeries.is_cacheable());

        assert!(OperationKind::CountSeries.allows_partial());
        assert!(!OperationKind::DeleteSeries.allows_partial());
        assert!(!OperationKind::WriteSeries.allows_partial());
    }

    #[test]
    fn test_canonical_includes_kind() {
        let a = MetadataQuery::FindTags(rf(FilterExpression::AlwaysTrue));
        let b = MetadataQuery::FindKeys(rf(FilterExpression::AlwaysTrue));
        assert_ne!(a.canonical(), b.canonical());
        assert!(a.canonical().starts_with("find_tags "));
    }

    #[test]
    fn test_canonical_normalizes_exclusions() {
        let q = |exclude: Vec<&str>| MetadataQuery::TagValuesSuggest {
            filter: rf(FilterExpression::AlwaysTrue),
            exclude: exclude.into_iter().map(String::from).collect(),
            group_limit: 5,
        };
        assert_eq!(q(vec!["b", "a"]).canonical(), q(vec!["a", "b", "a"]).canonical());
        assert_ne!(q(vec!["a"]).canonical(), q(vec!["b"]).canonical());
    }

    #[test]
    fn test_canonical_distinguishes_match_text() {
        let q = |key: Option<&str>| MetadataQuery::KeySuggest {
            filter: rf(FilterExpression::AlwaysTrue),
            options: MatchOptions::default(),
            key: key.map(String::from),
        };
        assert_ne!(q(Some("cp")).canonical(), q(Some("cpu")).canonical());
        assert_ne!(q(None).canonical(), q(Some("")).canonical());
    }
}
