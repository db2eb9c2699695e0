//! Typed results for every metadata operation
//!
//! Shards answer with the same types the cluster aggregate produces, so a
//! merge is always `Vec<T> -> T`. [`MetadataResult`] wraps all of them for
//! the cache and for the generic request entry point.

use super::query::OperationKind;
use crate::error::Error;
use crate::types::Series;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Tag keys and the values seen for each
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindTags {
    /// Tag key to distinct values
    pub tags: BTreeMap<String, BTreeSet<String>>,
    /// Number of distinct key/value pairs before truncation
    pub size: usize,
    /// True if keys were dropped to honour the limit
    #[serde(default)]
    pub limited: bool,
}

/// Distinct series keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindKeys {
    /// Keys, most frequently reported first
    pub keys: Vec<String>,
    /// Number of distinct keys before truncation
    pub size: usize,
    /// True if keys were dropped to honour the limit
    #[serde(default)]
    pub limited: bool,
}

/// Matching series identities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindSeries {
    /// Series in identity order
    pub series: Vec<Series>,
    /// True if series were dropped to honour the limit
    #[serde(default)]
    pub limited: bool,
}

/// Number of matching series
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSeries {
    /// Matching series across shards
    pub count: u64,
    /// True if a shard stopped counting at the limit
    #[serde(default)]
    pub limited: bool,
}

/// Delete acknowledgment
///
/// Deletion is at-least-once and not atomic across the cluster. A failed
/// aggregate may still have removed series from the shards that answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSeries {
    /// Series removed across acknowledging shards
    pub deleted: u64,
    /// Shards that acknowledged the delete
    pub acknowledged: usize,
}

/// One tag key with the number of series carrying it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagKeyCountEntry {
    /// Tag key
    pub key: String,
    /// Series carrying the key
    pub count: u64,
}

/// Tag keys ranked by series count
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagKeyCount {
    /// Keys with the highest count first
    pub suggestions: Vec<TagKeyCountEntry>,
    /// True if keys were dropped to honour the limit
    #[serde(default)]
    pub limited: bool,
}

/// Scored series key suggestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySuggestion {
    /// Suggested series key
    pub key: String,
    /// Relevance summed across shards
    pub score: f64,
}

/// Series key suggestions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySuggest {
    /// Highest score first
    pub suggestions: Vec<KeySuggestion>,
}

/// Scored tag key/value suggestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSuggestion {
    /// Tag key
    pub key: String,
    /// Tag value
    pub value: String,
    /// Relevance summed across shards
    pub score: f64,
}

/// Tag suggestions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagSuggest {
    /// Highest score first
    pub suggestions: Vec<TagSuggestion>,
}

/// Values of a single tag key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagValueSuggest {
    /// Values, most frequently reported first
    pub values: Vec<String>,
    /// True if values were dropped to honour the limit
    #[serde(default)]
    pub limited: bool,
}

/// Values grouped under one tag key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagValues {
    /// Tag key
    pub key: String,
    /// Values, most frequently reported first
    pub values: Vec<String>,
    /// True if values were dropped to honour the group limit
    #[serde(default)]
    pub limited: bool,
}

/// Tag keys with their values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagValuesSuggest {
    /// Keys with the most distinct values first
    pub suggestions: Vec<TagValues>,
    /// True if keys were dropped to honour the limit
    #[serde(default)]
    pub limited: bool,
}

/// Write acknowledgment from the owning shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Series stored
    pub accepted: u64,
    /// Series refused by the shard
    pub rejected: u64,
}

/// Any operation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetadataResult {
    /// Result of a tag enumeration
    FindTags(FindTags),
    /// Result of a key enumeration
    FindKeys(FindKeys),
    /// Result of a series enumeration
    FindSeries(FindSeries),
    /// Result of a series count
    CountSeries(CountSeries),
    /// Result of a delete
    DeleteSeries(DeleteSeries),
    /// Result of a tag key count
    TagKeyCount(TagKeyCount),
    /// Result of a key suggestion
    KeySuggest(KeySuggest),
    /// Result of a tag suggestion
    TagSuggest(TagSuggest),
    /// Result of a tag value suggestion
    TagValueSuggest(TagValueSuggest),
    /// Result of a grouped tag values suggestion
    TagValuesSuggest(TagValuesSuggest),
    /// Result of a series write
    WriteSeries(WriteResult),
}

impl MetadataResult {
    /// Operation that produced this result
    pub fn kind(&self) -> OperationKind {
        match self {
            MetadataResult::FindTags(_) => OperationKind::FindTags,
            MetadataResult::FindKeys(_) => OperationKind::FindKeys,
            MetadataResult::FindSeries(_) => OperationKind::FindSeries,
            MetadataResult::CountSeries(_) => OperationKind::CountSeries,
            MetadataResult::DeleteSeries(_) => OperationKind::DeleteSeries,
            MetadataResult::TagKeyCount(_) => OperationKind::TagKeyCount,
            MetadataResult::KeySuggest(_) => OperationKind::KeySuggest,
            MetadataResult::TagSuggest(_) => OperationKind::TagSuggest,
            MetadataResult::TagValueSuggest(_) => OperationKind::TagValueSuggest,
            MetadataResult::TagValuesSuggest(_) => OperationKind::TagValuesSuggest,
            MetadataResult::WriteSeries(_) => OperationKind::WriteSeries,
        }
    }
}

macro_rules! impl_result_conversions {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for MetadataResult {
                fn from(value: $ty) -> Self {
                    MetadataResult::$variant(value)
                }
            }

            impl TryFrom<MetadataResult> for $ty {
                type Error = Error;

                fn try_from(result: MetadataResult) -> Result<Self, Error> {
                    match result {
                        MetadataResult::$variant(value) => Ok(value),
                        other => Err(Error::UnexpectedResult {
                            expected: OperationKind::$variant.as_str(),
                            actual: other.kind().as_str(),
                        }),
                    }
                }
            }
        )*
    };
}

impl_result_conversions! {
    FindTags => FindTags,
    FindKeys => FindKeys,
    FindSeries => FindSeries,
    CountSeries => CountSeries,
    DeleteSeries => DeleteSeries,
    TagKeyCount => TagKeyCount,
    KeySuggest => KeySuggest,
    TagSuggest => TagSuggest,
    TagValueSuggest => TagValueSuggest,
    TagValuesSuggest => TagValuesSuggest,
    WriteSeries => WriteResult,
}
