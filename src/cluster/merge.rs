//! Per-operation merge policies
//!
//! Every function here folds the responses of several shards into one result.
//! Merges are commutative: the output never depends on the order of `parts`.
//! Duplicates inside one shard response are collapsed before counting, so a
//! shard that repeats an entry cannot inflate its frequency.
//!
//! # Ranking
//!
//! - **Scored entries** (key and tag suggestions): scores are summed across
//!   shards. Order is total score descending, then the best single-shard score
//!   descending, then the entry ascending.
//! - **Unscored entries** (keys, tag values): ranked by the number of shards
//!   reporting the entry, then the entry ascending.
//!
//! The limit is applied after ranking. With shards answering `{a:3, b:1}` and
//! `{a:2, c:5}` under limit 2 the result is `[c:5, a:5]`.

use super::results::{
    CountSeries, DeleteSeries, FindKeys, FindSeries, FindTags, KeySuggest, KeySuggestion,
    TagKeyCount, TagKeyCountEntry, TagSuggest, TagSuggestion, TagValueSuggest, TagValues,
    TagValuesSuggest,
};
use crate::filter::RangeFilter;
use crate::types::Series;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Ranking helpers
// ============================================================================

struct ScoreAccumulator {
    total: f64,
    peak: f64,
}

/// Sum scores per entry and order them
fn rank_scored<K: Ord>(entries: impl IntoIterator<Item = (K, f64)>) -> Vec<(K, f64)> {
    let mut acc: BTreeMap<K, ScoreAccumulator> = BTreeMap::new();
    for (key, score) in entries {
        let slot = acc.entry(key).or_insert_with(|| ScoreAccumulator {
            total: 0.0,
            peak: f64::NEG_INFINITY,
        });
        slot.total += score;
        slot.peak = slot.peak.max(score);
    }

    let mut ranked: Vec<(K, ScoreAccumulator)> = acc.into_iter().collect();
    ranked.sort_by(|(ka, a), (kb, b)| {
        b.total
            .total_cmp(&a.total)
            .then_with(|| b.peak.total_cmp(&a.peak))
            .then_with(|| ka.cmp(kb))
    });
    ranked.into_iter().map(|(k, s)| (k, s.total)).collect()
}

/// Count how many parts report each entry and order by that frequency
fn rank_by_frequency<K: Ord + Clone>(parts: impl IntoIterator<Item = BTreeSet<K>>) -> Vec<K> {
    let mut counts: BTreeMap<K, usize> = BTreeMap::new();
    for part in parts {
        for key in part {
            *counts.entry(key).or_default() += 1;
        }
    }
    rank_counted(counts)
}

fn rank_counted<K: Ord, N: Ord + Copy>(counts: BTreeMap<K, N>) -> Vec<K> {
    let mut ranked: Vec<(K, N)> = counts.into_iter().collect();
    ranked.sort_by(|(ka, a), (kb, b)| b.cmp(a).then_with(|| ka.cmp(kb)));
    ranked.into_iter().map(|(k, _)| k).collect()
}

// ============================================================================
// Enumeration
// ============================================================================

/// Union of tag maps; keys with the most values survive the limit
pub fn find_tags(parts: Vec<FindTags>, filter: &RangeFilter) -> FindTags {
    let mut limited = false;
    let mut union: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for part in parts {
        limited |= part.limited;
        for (key, values) in part.tags {
            union.entry(key).or_default().extend(values);
        }
    }

    let size = union.values().map(BTreeSet::len).sum();

    let counts: BTreeMap<String, usize> = union.iter().map(|(k, v)| (k.clone(), v.len())).collect();
    let mut ranked = rank_counted(counts);
    limited |= filter.truncate(&mut ranked);

    let keep: BTreeSet<String> = ranked.into_iter().collect();
    union.retain(|k, _| keep.contains(k));

    FindTags {
        tags: union,
        size,
        limited,
    }
}

/// Union of keys ranked by how many shards hold them
pub fn find_keys(parts: Vec<FindKeys>, filter: &RangeFilter) -> FindKeys {
    let mut limited = false;
    let sets: Vec<BTreeSet<String>> = parts
        .into_iter()
        .map(|part| {
            limited |= part.limited;
            part.keys.into_iter().collect()
        })
        .collect();

    let mut keys = rank_by_frequency(sets);
    let size = keys.len();
    limited |= filter.truncate(&mut keys);

    FindKeys {
        keys,
        size,
        limited,
    }
}

/// Union of series identities in identity order
pub fn find_series(parts: Vec<FindSeries>, filter: &RangeFilter) -> FindSeries {
    let mut limited = false;
    let mut union: BTreeSet<Series> = BTreeSet::new();
    for part in parts {
        limited |= part.limited;
        union.extend(part.series);
    }

    let mut series: Vec<Series> = union.into_iter().collect();
    limited |= filter.truncate(&mut series);

    FindSeries { series, limited }
}

// ============================================================================
// Counting
// ============================================================================

/// Sum of per-shard counts
pub fn count_series(parts: Vec<CountSeries>) -> CountSeries {
    parts.into_iter().fold(CountSeries::default(), |acc, part| CountSeries {
        count: acc.count.saturating_add(part.count),
        limited: acc.limited || part.limited,
    })
}

/// Sum of deletions over acknowledging shards
pub fn delete_series(parts: Vec<DeleteSeries>) -> DeleteSeries {
    parts.into_iter().fold(DeleteSeries::default(), |acc, part| DeleteSeries {
        deleted: acc.deleted.saturating_add(part.deleted),
        acknowledged: acc.acknowledged + part.acknowledged,
    })
}

/// Per-key series counts summed across shards
pub fn tag_key_count(parts: Vec<TagKeyCount>, filter: &RangeFilter) -> TagKeyCount {
    let mut limited = false;
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for part in parts {
        limited |= part.limited;
        let mut seen = BTreeSet::new();
        for entry in part.suggestions {
            if seen.insert(entry.key.clone()) {
                let slot = counts.entry(entry.key).or_default();
                *slot = slot.saturating_add(entry.count);
            }
        }
    }

    let totals = counts.clone();
    let mut keys = rank_counted(counts);
    limited |= filter.truncate(&mut keys);

    let suggestions = keys
        .into_iter()
        .map(|key| {
            let count = totals.get(&key).copied().unwrap_or_default();
            TagKeyCountEntry { key, count }
        })
        .collect();

    TagKeyCount {
        suggestions,
        limited,
    }
}

// ============================================================================
// Suggestions
// ============================================================================

/// Scored union of key suggestions
pub fn key_suggest(parts: Vec<KeySuggest>, filter: &RangeFilter) -> KeySuggest {
    let entries = parts.into_iter().flat_map(|part| {
        dedup_scored(part.suggestions.into_iter().map(|s| (s.key, s.score)))
    });

    let mut ranked = rank_scored(entries);
    filter.truncate(&mut ranked);

    KeySuggest {
        suggestions: ranked
            .into_iter()
            .map(|(key, score)| KeySuggestion { key, score })
            .collect(),
    }
}

/// Scored union of tag suggestions keyed by `(key, value)`
pub fn tag_suggest(parts: Vec<TagSuggest>, filter: &RangeFilter) -> TagSuggest {
    let entries = parts.into_iter().flat_map(|part| {
        dedup_scored(
            part.suggestions
                .into_iter()
                .map(|s| ((s.key, s.value), s.score)),
        )
    });

    let mut ranked = rank_scored(entries);
    filter.truncate(&mut ranked);

    TagSuggest {
        suggestions: ranked
            .into_iter()
            .map(|((key, value), score)| TagSuggestion { key, value, score })
            .collect(),
    }
}

/// Union of values ranked by how many shards report them
pub fn tag_value_suggest(parts: Vec<TagValueSuggest>, filter: &RangeFilter) -> TagValueSuggest {
    let mut limited = false;
    let sets: Vec<BTreeSet<String>> = parts
        .into_iter()
        .map(|part| {
            limited |= part.limited;
            part.values.into_iter().collect()
        })
        .collect();

    let mut values = rank_by_frequency(sets);
    limited |= filter.truncate(&mut values);

    TagValueSuggest { values, limited }
}

/// Values grouped by key
///
/// Keys are ranked by distinct value count. Each key keeps at most
/// `group_limit` values in ascending order.
pub fn tag_values_suggest(
    parts: Vec<TagValuesSuggest>,
    filter: &RangeFilter,
    group_limit: usize,
) -> TagValuesSuggest {
    let mut limited = false;
    let mut groups: BTreeMap<String, (BTreeSet<String>, bool)> = BTreeMap::new();
    for part in parts {
        limited |= part.limited;
        for group in part.suggestions {
            let slot = groups.entry(group.key).or_default();
            slot.0.extend(group.values);
            slot.1 |= group.limited;
        }
    }

    let counts: BTreeMap<String, usize> =
        groups.iter().map(|(k, (v, _))| (k.clone(), v.len())).collect();
    let mut keys = rank_counted(counts);
    limited |= filter.truncate(&mut keys);

    let suggestions = keys
        .into_iter()
        .filter_map(|key| {
            let (values, group_limited) = groups.remove(&key)?;
            let mut values: Vec<String> = values.into_iter().collect();
            let truncated = values.len() > group_limit;
            values.truncate(group_limit);
            Some(TagValues {
                key,
                values,
                limited: group_limited || truncated,
            })
        })
        .collect();

    TagValuesSuggest {
        suggestions,
        limited,
    }
}

/// Keep the best score per entry within a single shard response
fn dedup_scored<K: Ord>(entries: impl Iterator<Item = (K, f64)>) -> Vec<(K, f64)> {
    let mut best: BTreeMap<K, f64> = BTreeMap::new();
    for (key, score) in entries {
        best.entry(key)
            .and_modify(|s| {
                if score.total_cmp(s) == Ordering::Greater {
                    *s = score
                }
            })
            .or_insert(score);
    }
    best.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterExpression;
    use crate::types::TimeRange;

    fn rf(limit: Option<usize>) -> RangeFilter {
        RangeFilter::new(
            FilterExpression::AlwaysTrue,
            TimeRange::new(0, 1).unwrap(),
            limit,
        )
        .unwrap()
    }

    fn tags(entries: &[(&str, f64)]) -> TagSuggest {
        TagSuggest {
            suggestions: entries
                .iter()
                .map(|(v, score)| TagSuggestion {
                    key: "host".into(),
                    value: v.to_string(),
                    score: *score,
                })
                .collect(),
        }
    }

    fn values_of(result: &TagSuggest) -> Vec<(&str, f64)> {
        result
            .suggestions
            .iter()
            .map(|s| (s.value.as_str(), s.score))
            .collect()
    }

    #[test]
    fn test_tag_suggest_sum_and_rank() {
        let merged = tag_suggest(
            vec![tags(&[("a", 3.0), ("b", 1.0)]), tags(&[("a", 2.0), ("c", 5.0)])],
            &rf(Some(2)),
        );
        assert_eq!(values_of(&merged), vec![("c", 5.0), ("a", 5.0)]);
    }

    #[test]
    fn test_tag_suggest_order_independent() {
        let forward = tag_suggest(
            vec![tags(&[("a", 3.0), ("b", 1.0)]), tags(&[("a", 2.0), ("c", 5.0)])],
            &rf(None),
        );
        let backward = tag_suggest(
            vec![tags(&[("a", 2.0), ("c", 5.0)]), tags(&[("a", 3.0), ("b", 1.0)])],
            &rf(None),
        );
        assert_eq!(forward, backward);
        assert_eq!(values_of(&forward), vec![("c", 5.0), ("a", 5.0), ("b", 1.0)]);
    }

    #[test]
    fn test_scored_lexicographic_tie_break() {
        let merged = tag_suggest(vec![tags(&[("b", 2.0), ("a", 2.0)])], &rf(None));
        assert_eq!(values_of(&merged), vec![("a", 2.0), ("b", 2.0)]);
    }

    #[test]
    fn test_duplicate_within_shard_counts_once() {
        let merged = tag_suggest(vec![tags(&[("a", 1.0), ("a", 4.0)])], &rf(None));
        assert_eq!(values_of(&merged), vec![("a", 4.0)]);
    }

    #[test]
    fn test_key_suggest_limit() {
        let part = |keys: &[(&str, f64)]| KeySuggest {
            suggestions: keys
                .iter()
                .map(|(k, s)| KeySuggestion {
                    key: k.to_string(),
                    score: *s,
                })
                .collect(),
        };
        let merged = key_suggest(
            vec![part(&[("cpu", 1.0), ("mem", 1.0)]), part(&[("cpu", 1.0)])],
            &rf(Some(1)),
        );
        assert_eq!(merged.suggestions.len(), 1);
        assert_eq!(merged.suggestions[0].key, "cpu");
        assert_eq!(merged.suggestions[0].score, 2.0);
    }

    #[test]
    fn test_find_keys_frequency() {
        let part = |keys: &[&str]| FindKeys {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            size: keys.len(),
            limited: false,
        };
        let merged = find_keys(
            vec![part(&["mem", "cpu", "cpu"]), part(&["disk", "cpu"]), part(&["mem"])],
            &rf(Some(2)),
        );
        assert_eq!(merged.keys, vec!["cpu", "mem"]);
        assert_eq!(merged.size, 3);
        assert!(merged.limited);
    }

    #[test]
    fn test_find_tags_union() {
        let part = |pairs: &[(&str, &str)]| {
            let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for (k, v) in pairs {
                tags.entry(k.to_string()).or_default().insert(v.to_string());
            }
            FindTags {
                size: pairs.len(),
                tags,
                limited: false,
            }
        };
        let merged = find_tags(
            vec![
                part(&[("host", "a"), ("dc", "eu")]),
                part(&[("host", "b"), ("host", "a"), ("role", "db")]),
            ],
            &rf(None),
        );
        assert_eq!(merged.size, 4);
        assert_eq!(merged.tags["host"].len(), 2);
        assert!(!merged.limited);

        let limited = find_tags(
            vec![
                part(&[("host", "a"), ("host", "b"), ("dc", "eu")]),
                part(&[("role", "db")]),
            ],
            &rf(Some(1)),
        );
        assert_eq!(limited.tags.keys().collect::<Vec<_>>(), vec!["host"]);
        assert!(limited.limited);
        assert_eq!(limited.size, 4);
    }

    #[test]
    fn test_find_series_union() {
        let a = Series::new("cpu").with_tag("host", "a");
        let b = Series::new("cpu").with_tag("host", "b");
        let merged = find_series(
            vec![
                FindSeries {
                    series: vec![b.clone(), a.clone()],
                    limited: false,
                },
                FindSeries {
                    series: vec![a.clone()],
                    limited: false,
                },
            ],
            &rf(None),
        );
        assert_eq!(merged.series, vec![a, b]);
    }

    #[test]
    fn test_count_series_sum() {
        let merged = count_series(vec![
            CountSeries {
                count: 3,
                limited: false,
            },
            CountSeries {
                count: 4,
                limited: true,
            },
        ]);
        assert_eq!(merged.count, 7);
        assert!(merged.limited);
    }

    #[test]
    fn test_delete_series_counts_acknowledgments() {
        let merged = delete_series(vec![
            DeleteSeries {
                deleted: 2,
                acknowledged: 1,
            },
            DeleteSeries {
                deleted: 0,
                acknowledged: 1,
            },
        ]);
        assert_eq!(merged.deleted, 2);
        assert_eq!(merged.acknowledged, 2);
    }

    #[test]
    fn test_tag_key_count() {
        let part = |entries: &[(&str, u64)]| TagKeyCount {
            suggestions: entries
                .iter()
                .map(|(k, c)| TagKeyCountEntry {
                    key: k.to_string(),
                    count: *c,
                })
                .collect(),
            limited: false,
        };
        let merged = tag_key_count(
            vec![part(&[("host", 3), ("dc", 1)]), part(&[("dc", 5), ("role", 1)])],
            &rf(Some(2)),
        );
        let got: Vec<(&str, u64)> = merged
            .suggestions
            .iter()
            .map(|e| (e.key.as_str(), e.count))
            .collect();
        assert_eq!(got, vec![("dc", 6), ("host", 3)]);
        assert!(merged.limited);
    }

    #[test]
    fn test_tag_value_suggest() {
        let part = |values: &[&str]| TagValueSuggest {
            values: values.iter().map(|v| v.to_string()).collect(),
            limited: false,
        };
        let merged = tag_value_suggest(vec![part(&["b", "a"]), part(&["b"])], &rf(None));
        assert_eq!(merged.values, vec!["b", "a"]);
        assert!(!merged.limited);
    }

    #[test]
    fn test_tag_values_suggest_group_limit() {
        let part = |key: &str, values: &[&str]| TagValuesSuggest {
            suggestions: vec![TagValues {
                key: key.to_string(),
                values: values.iter().map(|v| v.to_string()).collect(),
                limited: false,
            }],
            limited: false,
        };
        let merged = tag_values_suggest(
            vec![
                part("host", &["c", "a"]),
                part("host", &["b"]),
                part("dc", &["eu"]),
            ],
            &rf(None),
            2,
        );
        assert_eq!(merged.suggestions.len(), 2);
        assert_eq!(merged.suggestions[0].key, "host");
        assert_eq!(merged.suggestions[0].values, vec!["a", "b"]);
        assert!(merged.suggestions[0].limited);
        assert_eq!(merged.suggestions[1].key, "dc");
        assert!(!merged.suggestions[1].limited);
    }
}
