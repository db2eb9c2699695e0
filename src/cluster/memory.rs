//! In-memory shard
//!
//! A [`ShardClient`] backed by a map from series to the span of time it was
//! active. It answers every operation locally and supports failure and
//! latency injection, which makes it the shard of choice for tests, benches
//! and the `metaq` CLI.

use super::merge;
use super::query::MatchOptions;
use super::results::*;
use super::{ShardClient, ShardResult};
use crate::error::ShardError;
use crate::filter::RangeFilter;
use crate::types::{Series, TimeRange, Timestamp};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Score for a suggestion with no match text
const SCORE_ANY: f64 = 1.0;
/// Score for an exact match
const SCORE_EXACT: f64 = 4.0;
/// Score for a prefix match
const SCORE_PREFIX: f64 = 3.0;
/// Score for a substring match
const SCORE_CONTAINS: f64 = 2.0;
/// Score for a fuzzy match sharing the required prefix
const SCORE_FUZZY: f64 = 1.0;

/// Shard holding its index in memory
pub struct InMemoryShard {
    id: String,
    /// Series to the span during which it was written
    index: RwLock<BTreeMap<Series, TimeRange>>,
    failure: RwLock<Option<ShardError>>,
    latency: RwLock<Duration>,
    calls: AtomicU64,
    completed: AtomicU64,
}

impl InMemoryShard {
    /// Create an empty shard
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index: RwLock::new(BTreeMap::new()),
            failure: RwLock::new(None),
            latency: RwLock::new(Duration::ZERO),
            calls: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Record `series` as active at `timestamp`
    pub fn insert(&self, series: Series, timestamp: Timestamp) {
        self.insert_range(series, TimeRange::at(timestamp));
    }

    /// Record `series` as active during `range`, widening any existing span
    pub fn insert_range(&self, series: Series, range: TimeRange) {
        let mut index = self.index.write();
        index
            .entry(series)
            .and_modify(|span| {
                span.start = span.start.min(range.start);
                span.end = span.end.max(range.end);
            })
            .or_insert(range);
    }

    /// Number of series held
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// True if no series are held
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Make every subsequent call fail with `failure`, or clear it with `None`
    pub fn fail_with(&self, failure: Option<ShardError>) {
        *self.failure.write() = failure;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Calls received, including those still running or dropped
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Calls that ran to completion
    pub fn completed_calls(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Entry to every operation: count, delay, maybe fail
    async fn admit(&self, operation: &str) -> ShardResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failure = self.failure.read().clone();
        self.completed.fetch_add(1, Ordering::Relaxed);
        debug!(shard = %self.id, operation, failed = failure.is_some(), "Serving");

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Series matching the filter and overlapping its range
    fn matching(&self, filter: &RangeFilter) -> Vec<Series> {
        let range = filter.range();
        self.index
            .read()
            .iter()
            .filter(|(series, span)| span.overlaps(&range) && filter.filter().matches(series))
            .map(|(series, _)| series.clone())
            .collect()
    }
}

impl std::fmt::Debug for InMemoryShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryShard")
            .field("id", &self.id)
            .field("series", &self.len())
            .finish()
    }
}

/// Score `candidate` against optional match text
fn score(candidate: &str, text: Option<&str>, options: &MatchOptions) -> Option<f64> {
    let text = match text {
        None | Some("") => return Some(SCORE_ANY),
        Some(text) => text,
    };

    if candidate == text {
        Some(SCORE_EXACT)
    } else if candidate.starts_with(text) {
        Some(SCORE_PREFIX)
    } else if candidate.contains(text) {
        Some(SCORE_CONTAINS)
    } else if options.fuzzy && shares_prefix(candidate, text, options.prefix_length) {
        Some(SCORE_FUZZY)
    } else {
        None
    }
}

fn shares_prefix(a: &str, b: &str, length: usize) -> bool {
    let a: Vec<char> = a.chars().take(length).collect();
    let b: Vec<char> = b.chars().take(length).collect();
    a.len() == length && a == b
}

/// Order scored entries best first and keep at most `limit`
fn top_scored<K: Ord>(mut entries: Vec<(K, f64)>, limit: Option<usize>) -> Vec<(K, f64)> {
    entries.sort_by(|(ka, a), (kb, b)| b.total_cmp(a).then_with(|| ka.cmp(kb)));
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    entries
}

/// Keep only fuzzy hits up to `max_expansions`
fn cap_fuzzy<K>(entries: Vec<(K, f64)>, options: &MatchOptions) -> Vec<(K, f64)> {
    let mut fuzzy = 0;
    entries
        .into_iter()
        .filter(|(_, s)| {
            if *s == SCORE_FUZZY && options.fuzzy {
                fuzzy += 1;
                fuzzy <= options.max_expansions
            } else {
                true
            }
        })
        .collect()
}

#[async_trait]
impl ShardClient for InMemoryShard {
    fn id(&self) -> &str {
        &self.id
    }

    async fn find_tags(&self, filter: &RangeFilter) -> ShardResult<FindTags> {
        self.admit("find_tags").await?;

        let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for series in self.matching(filter) {
            for (k, v) in series.tags {
                tags.entry(k).or_default().insert(v);
            }
        }
        let size = tags.values().map(BTreeSet::len).sum();

        Ok(merge::find_tags(
            vec![FindTags {
                tags,
                size,
                limited: false,
            }],
            filter,
        ))
    }

    async fn find_keys(&self, filter: &RangeFilter) -> ShardResult<FindKeys> {
        self.admit("find_keys").await?;

        let keys: BTreeSet<String> = self.matching(filter).into_iter().map(|s| s.key).collect();
        let size = keys.len();

        Ok(merge::find_keys(
            vec![FindKeys {
                keys: keys.into_iter().collect(),
                size,
                limited: false,
            }],
            filter,
        ))
    }

    async fn find_series(&self, filter: &RangeFilter) -> ShardResult<FindSeries> {
        self.admit("find_series").await?;

        Ok(merge::find_series(
            vec![FindSeries {
                series: self.matching(filter),
                limited: false,
            }],
            filter,
        ))
    }

    async fn count_series(&self, filter: &RangeFilter) -> ShardResult<CountSeries> {
        self.admit("count_series").await?;

        let count = self.matching(filter).len() as u64;
        Ok(match filter.limit() {
            Some(limit) if count > limit as u64 => CountSeries {
                count: limit as u64,
                limited: true,
            },
            _ => CountSeries {
                count,
                limited: false,
            },
        })
    }

    async fn delete_series(&self, filter: &RangeFilter) -> ShardResult<DeleteSeries> {
        self.admit("delete_series").await?;

        let doomed = self.matching(filter);
        let mut index = self.index.write();
        let deleted = doomed
            .iter()
            .filter(|series| index.remove(*series).is_some())
            .count() as u64;

        Ok(DeleteSeries {
            deleted,
            acknowledged: 1,
        })
    }

    async fn tag_key_count(&self, filter: &RangeFilter) -> ShardResult<TagKeyCount> {
        self.admit("tag_key_count").await?;

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for series in self.matching(filter) {
            for key in series.tags.into_keys() {
                *counts.entry(key).or_default() += 1;
            }
        }

        Ok(merge::tag_key_count(
            vec![TagKeyCount {
                suggestions: counts
                    .into_iter()
                    .map(|(key, count)| TagKeyCountEntry { key, count })
                    .collect(),
                limited: false,
            }],
            filter,
        ))
    }

    async fn key_suggest(
        &self,
        filter: &RangeFilter,
        options: &MatchOptions,
        key: Option<&str>,
    ) -> ShardResult<KeySuggest> {
        self.admit("key_suggest").await?;

        let keys: BTreeSet<String> = self.matching(filter).into_iter().map(|s| s.key).collect();
        let scored: Vec<(String, f64)> = keys
            .into_iter()
            .filter_map(|k| score(&k, key, options).map(|s| (k, s)))
            .collect();

        let suggestions = top_scored(cap_fuzzy(scored, options), filter.limit())
            .into_iter()
            .map(|(key, score)| KeySuggestion { key, score })
            .collect();

        Ok(KeySuggest { suggestions })
    }

    async fn tag_suggest(
        &self,
        filter: &RangeFilter,
        options: &MatchOptions,
        key: Option<&str>,
        value: Option<&str>,
    ) -> ShardResult<TagSuggest> {
        self.admit("tag_suggest").await?;

        let pairs: BTreeSet<(String, String)> = self
            .matching(filter)
            .into_iter()
            .flat_map(|s| s.tags.into_iter())
            .collect();

        let scored: Vec<((String, String), f64)> = pairs
            .into_iter()
            .filter_map(|(k, v)| {
                let ks = score(&k, key, options)?;
                let vs = score(&v, value, options)?;
                Some(((k, v), ks + vs))
            })
            .collect();

        let suggestions = top_scored(scored, filter.limit())
            .into_iter()
            .map(|((key, value), score)| TagSuggestion { key, value, score })
            .collect();

        Ok(TagSuggest { suggestions })
    }

    async fn tag_value_suggest(
        &self,
        filter: &RangeFilter,
        key: Option<&str>,
    ) -> ShardResult<TagValueSuggest> {
        self.admit("tag_value_suggest").await?;

        let values: BTreeSet<String> = self
            .matching(filter)
            .into_iter()
            .flat_map(|s| s.tags.into_iter())
            .filter(|(k, _)| key.map_or(true, |key| k == key))
            .map(|(_, v)| v)
            .collect();

        Ok(merge::tag_value_suggest(
            vec![TagValueSuggest {
                values: values.into_iter().collect(),
                limited: false,
            }],
            filter,
        ))
    }

    async fn tag_values_suggest(
        &self,
        filter: &RangeFilter,
        exclude: &[String],
        group_limit: usize,
    ) -> ShardResult<TagValuesSuggest> {
        self.admit("tag_values_suggest").await?;

        let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for series in self.matching(filter) {
            for (k, v) in series.tags {
                if !exclude.contains(&k) {
                    groups.entry(k).or_default().insert(v);
                }
            }
        }

        let suggestions = groups
            .into_iter()
            .map(|(key, values)| TagValues {
                key,
                values: values.into_iter().collect(),
                limited: false,
            })
            .collect();

        Ok(merge::tag_values_suggest(
            vec![TagValuesSuggest {
                suggestions,
                limited: false,
            }],
            filter,
            group_limit,
        ))
    }

    async fn write_series(&self, range: &TimeRange, series: &Series) -> ShardResult<WriteResult> {
        self.admit("write_series").await?;

        if series.key.is_empty() {
            return Ok(WriteResult {
                accepted: 0,
                rejected: 1,
            });
        }

        self.insert_range(series.clone(), *range);
        Ok(WriteResult {
            accepted: 1,
            rejected: 0,
        })
    }
}
