//! Transport-facing metadata entry points
//!
//! [`MetadataService`] turns request bodies (query tokens, range bounds and an
//! optional limit) into dispatched cluster queries. Every entry point is
//! async and resolves to exactly one typed aggregate.
//!
//! # Error split
//!
//! - `Err(Error)`: the request itself was malformed (temporal literal,
//!   filter syntax, range or limit). Nothing was dispatched.
//! - `Ok(AggregateOutcome::Failed(..))`: the cluster could not answer
//!   (unknown group, shard failure, timeout, cancellation).
//!
//! # Caching
//!
//! Enumeration and suggestion requests go through the
//! [`MetadataQueryCache`]. Deletes and writes invalidate it.

use crate::cache::MetadataQueryCache;
use crate::cluster::{
    AggregateOutcome, ClusterManager, CountSeries, DeleteSeries, DispatchOptions, FindKeys,
    FindSeries, FindTags, KeySuggest, MatchOptions, MetadataQuery, MetadataResult, TagKeyCount,
    TagSuggest, TagValueSuggest, TagValuesSuggest, WriteResult,
};
use crate::error::{Error, Result};
use crate::filter::{FilterGrammar, RangeFilter};
use crate::time::{resolve_range, DEFAULT_RANGE_DAYS};
use crate::types::{now_millis, Series, TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Limit applied to suggestion requests that do not carry one
pub const DEFAULT_SUGGEST_LIMIT: i64 = 10;

/// Values kept per key by tag-values suggestions
pub const DEFAULT_GROUP_LIMIT: usize = 10;

// ============================================================================
// Request bodies
// ============================================================================

/// A range bound: epoch milliseconds or a temporal literal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstantInput {
    /// Absolute epoch milliseconds
    Millis(Timestamp),
    /// Text resolved by [`resolve_instant`](crate::time::resolve_instant)
    Literal(String),
}

impl InstantInput {
    fn as_literal(&self) -> String {
        match self {
            InstantInput::Millis(ms) => ms.to_string(),
            InstantInput::Literal(text) => text.clone(),
        }
    }
}

/// Optional start and end bounds
///
/// Missing bounds default to the window of the last
/// [`DEFAULT_RANGE_DAYS`] days ending now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeInput {
    /// Inclusive start
    #[serde(default)]
    pub start: Option<InstantInput>,
    /// Inclusive end
    #[serde(default)]
    pub end: Option<InstantInput>,
}

impl RangeInput {
    /// Resolve both bounds against `now`
    pub fn resolve(&self, now: Timestamp) -> Result<TimeRange> {
        let start = self.start.as_ref().map(InstantInput::as_literal);
        let end = self.end.as_ref().map(InstantInput::as_literal);
        resolve_range(start.as_deref(), end.as_deref(), now)
    }
}

/// Query tokens, range and limit shared by every request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataQueryBody {
    /// Raw query tokens; empty matches everything
    #[serde(default)]
    pub query: Vec<String>,

    /// Range bounds, defaulting to the last week
    #[serde(default)]
    pub range: RangeInput,

    /// Must be positive when present
    #[serde(default)]
    pub limit: Option<i64>,
}

impl MetadataQueryBody {
    /// Body with the given query tokens and defaults elsewhere
    pub fn with_query<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Series key suggestion request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySuggestBody {
    /// Query, range and limit
    #[serde(flatten)]
    pub body: MetadataQueryBody,
    /// Text matching knobs, sent as `match`
    #[serde(default, rename = "match")]
    pub match_options: MatchOptions,
    /// Partial key typed so far
    #[serde(default)]
    pub key: Option<String>,
}

/// Tag suggestion request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSuggestBody {
    /// Query, range and limit
    #[serde(flatten)]
    pub body: MetadataQueryBody,
    /// Text matching knobs, sent as `match`
    #[serde(default, rename = "match")]
    pub match_options: MatchOptions,
    /// Partial tag key
    #[serde(default)]
    pub key: Option<String>,
    /// Partial tag value
    #[serde(default)]
    pub value: Option<String>,
}

/// Tag value suggestion request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagValueSuggestBody {
    /// Query, range and limit
    #[serde(flatten)]
    pub body: MetadataQueryBody,
    /// Tag key; every key when absent
    #[serde(default)]
    pub key: Option<String>,
}

/// Grouped tag values request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagValuesSuggestBody {
    /// Query, range and limit
    #[serde(flatten)]
    pub body: MetadataQueryBody,
    /// Tag keys left out of the answer
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Values kept per key; must be positive
    #[serde(default = "default_group_limit")]
    pub group_limit: usize,
}

fn default_group_limit() -> usize {
    DEFAULT_GROUP_LIMIT
}

impl Default for TagValuesSuggestBody {
    fn default() -> Self {
        Self {
            body: MetadataQueryBody::default(),
            exclude: Vec::new(),
            group_limit: DEFAULT_GROUP_LIMIT,
        }
    }
}

/// Any metadata request
///
/// An absent body is the default body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "body", rename_all = "snake_case")]
pub enum MetadataRequest {
    /// See [`MetadataService::tags`]
    Tags(Option<MetadataQueryBody>),
    /// See [`MetadataService::keys`]
    Keys(Option<MetadataQueryBody>),
    /// See [`MetadataService::series`]
    Series(Option<MetadataQueryBody>),
    /// See [`MetadataService::delete_series`]
    DeleteSeries(Option<MetadataQueryBody>),
    /// See [`MetadataService::add_series`]
    AddSeries(Series),
    /// See [`MetadataService::series_count`]
    SeriesCount(Option<MetadataQueryBody>),
    /// See [`MetadataService::tagkey_count`]
    TagkeyCount(Option<MetadataQueryBody>),
    /// See [`MetadataService::key_suggest`]
    KeySuggest(Option<KeySuggestBody>),
    /// See [`MetadataService::tag_suggest`]
    TagSuggest(Option<TagSuggestBody>),
    /// See [`MetadataService::tag_value_suggest`]
    TagValueSuggest(Option<TagValueSuggestBody>),
    /// See [`MetadataService::tag_values_suggest`]
    TagValuesSuggest(Option<TagValuesSuggestBody>),
}

// ============================================================================
// Service
// ============================================================================

/// Metadata entry points over a cluster
pub struct MetadataService {
    grammar: Arc<dyn FilterGrammar>,
    cluster: Arc<ClusterManager>,
    cache: MetadataQueryCache,
    clock: fn() -> Timestamp,
}

impl MetadataService {
    /// Create a service
    pub fn new(
        grammar: Arc<dyn FilterGrammar>,
        cluster: Arc<ClusterManager>,
        cache: MetadataQueryCache,
    ) -> Self {
        info!(
            default_group = cluster.default_group_name(),
            cache_enabled = cache.config().enabled,
            "Metadata service ready"
        );

        Self {
            grammar,
            cluster,
            cache,
            clock: now_millis,
        }
    }

    /// Replace the wall clock used to resolve relative literals
    pub fn with_clock(mut self, clock: fn() -> Timestamp) -> Self {
        self.clock = clock;
        self
    }

    /// The cache in front of read operations
    pub fn cache(&self) -> &MetadataQueryCache {
        &self.cache
    }

    /// Build the range filter for a body
    ///
    /// Absent or empty query tokens produce an always-true filter. Shards
    /// receive the filter in normal form.
    pub fn range_filter(&self, body: &MetadataQueryBody) -> Result<RangeFilter> {
        self.range_filter_with(body, body.limit)
    }

    fn range_filter_with(&self, body: &MetadataQueryBody, limit: Option<i64>) -> Result<RangeFilter> {
        let filter = self.grammar.parse(&body.query)?;
        let range = body.range.resolve((self.clock)())?;
        Ok(RangeFilter::with_signed_limit(filter, range, limit)?.normalized())
    }

    fn suggest_filter(&self, body: &MetadataQueryBody) -> Result<RangeFilter> {
        self.range_filter_with(body, Some(body.limit.unwrap_or(DEFAULT_SUGGEST_LIMIT)))
    }

    /// Tag keys and values of matching series
    pub async fn tags(
        &self,
        body: Option<MetadataQueryBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<FindTags>> {
        let body = body.unwrap_or_default();
        let filter = self.range_filter(&body)?;
        self.run(MetadataQuery::FindTags(filter), options).await
    }

    /// Distinct keys of matching series
    pub async fn keys(
        &self,
        body: Option<MetadataQueryBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<FindKeys>> {
        let body = body.unwrap_or_default();
        let filter = self.range_filter(&body)?;
        self.run(MetadataQuery::FindKeys(filter), options).await
    }

    /// Matching series
    pub async fn series(
        &self,
        body: Option<MetadataQueryBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<FindSeries>> {
        let body = body.unwrap_or_default();
        let filter = self.range_filter(&body)?;
        self.run(MetadataQuery::FindSeries(filter), options).await
    }

    /// Delete matching series from every shard
    ///
    /// Not atomic: a failed aggregate may still have deleted series on the
    /// shards that answered. The limit, if any, is ignored.
    pub async fn delete_series(
        &self,
        body: Option<MetadataQueryBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<DeleteSeries>> {
        let body = body.unwrap_or_default();
        let filter = self.range_filter_with(&body, None)?;
        self.run(MetadataQuery::DeleteSeries(filter), options).await
    }

    /// Write a series to its owning shard, stamped with the current instant
    pub async fn add_series(
        &self,
        series: Series,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<WriteResult>> {
        if series.key.is_empty() {
            return Err(Error::InvalidRangeFilter("series key must not be empty".to_string()));
        }

        let range = TimeRange::at((self.clock)());
        self.run(MetadataQuery::WriteSeries { range, series }, options)
            .await
    }

    /// Number of matching series
    pub async fn series_count(
        &self,
        body: Option<MetadataQueryBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<CountSeries>> {
        let body = body.unwrap_or_default();
        let filter = self.range_filter(&body)?;
        self.run(MetadataQuery::CountSeries(filter), options).await
    }

    /// Series count per tag key
    pub async fn tagkey_count(
        &self,
        body: Option<MetadataQueryBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<TagKeyCount>> {
        let body = body.unwrap_or_default();
        let filter = self.range_filter(&body)?;
        self.run(MetadataQuery::TagKeyCount(filter), options).await
    }

    /// Series keys similar to `key`
    pub async fn key_suggest(
        &self,
        body: Option<KeySuggestBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<KeySuggest>> {
        let request = body.unwrap_or_default();
        let filter = self.suggest_filter(&request.body)?;
        let query = MetadataQuery::KeySuggest {
            filter,
            options: request.match_options,
            key: request.key,
        };
        self.run(query, options).await
    }

    /// Tag pairs similar to `key` and `value`
    pub async fn tag_suggest(
        &self,
        body: Option<TagSuggestBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<TagSuggest>> {
        let request = body.unwrap_or_default();
        let filter = self.suggest_filter(&request.body)?;
        let query = MetadataQuery::TagSuggest {
            filter,
            options: request.match_options,
            key: request.key,
            value: request.value,
        };
        self.run(query, options).await
    }

    /// Values of one tag key
    pub async fn tag_value_suggest(
        &self,
        body: Option<TagValueSuggestBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<TagValueSuggest>> {
        let request = body.unwrap_or_default();
        let filter = self.suggest_filter(&request.body)?;
        let query = MetadataQuery::TagValueSuggest {
            filter,
            key: request.key,
        };
        self.run(query, options).await
    }

    /// Values grouped by tag key
    pub async fn tag_values_suggest(
        &self,
        body: Option<TagValuesSuggestBody>,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<TagValuesSuggest>> {
        let request = body.unwrap_or_default();
        if request.group_limit == 0 {
            return Err(Error::InvalidRangeFilter(
                "group limit must be positive".to_string(),
            ));
        }
        let filter = self.suggest_filter(&request.body)?;
        let query = MetadataQuery::TagValuesSuggest {
            filter,
            exclude: request.exclude,
            group_limit: request.group_limit,
        };
        self.run(query, options).await
    }

    /// Serve any request
    pub async fn handle(
        &self,
        request: MetadataRequest,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<MetadataResult>> {
        Ok(match request {
            MetadataRequest::Tags(body) => self.tags(body, options).await?.map(MetadataResult::from),
            MetadataRequest::Keys(body) => self.keys(body, options).await?.map(MetadataResult::from),
            MetadataRequest::Series(body) => self.series(body, options).await?.map(MetadataResult::from),
            MetadataRequest::DeleteSeries(body) => {
                self.delete_series(body, options).await?.map(MetadataResult::from)
            }
            MetadataRequest::AddSeries(series) => {
                self.add_series(series, options).await?.map(MetadataResult::from)
            }
            MetadataRequest::SeriesCount(body) => {
                self.series_count(body, options).await?.map(MetadataResult::from)
            }
            MetadataRequest::TagkeyCount(body) => {
                self.tagkey_count(body, options).await?.map(MetadataResult::from)
            }
            MetadataRequest::KeySuggest(body) => {
                self.key_suggest(body, options).await?.map(MetadataResult::from)
            }
            MetadataRequest::TagSuggest(body) => {
                self.tag_suggest(body, options).await?.map(MetadataResult::from)
            }
            MetadataRequest::TagValueSuggest(body) => {
                self.tag_value_suggest(body, options).await?.map(MetadataResult::from)
            }
            MetadataRequest::TagValuesSuggest(body) => {
                self.tag_values_suggest(body, options).await?.map(MetadataResult::from)
            }
        })
    }

    /// Dispatch on the default group and narrow the result type
    async fn run<T>(
        &self,
        query: MetadataQuery,
        options: DispatchOptions,
    ) -> Result<AggregateOutcome<T>>
    where
        T: TryFrom<MetadataResult, Error = Error>,
    {
        let group = match self.cluster.use_default_group() {
            Ok(group) => group,
            Err(err) => return Ok(AggregateOutcome::Failed(err)),
        };

        let kind = query.kind();
        debug!(operation = %kind, group = group.name(), "Dispatching metadata request");

        let outcome = self.cache.get(group, query, options).await;

        // A failed delete may still have removed series on some shards
        if kind.is_mutation() {
            self.cache.invalidate_all();
        }

        outcome.try_map(T::try_from)
    }
}

impl std::fmt::Debug for MetadataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataService")
            .field("default_group", &self.cluster.default_group_name())
            .field("cache", &self.cache)
            .field("default_range_days", &DEFAULT_RANGE_DAYS)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::cluster::{ClusterDispatch, InMemoryShard, ShardClient, StaticClusterGroup};
    use crate::error::ShardError;
    use crate::filter::{FilterExpression, QueryGrammar};
    use crate::types::DAY_MS;

    /// 2021-06-01T09:15:30.500Z
    const NOW: Timestamp = 1_622_538_930_500;

    fn fixed_now() -> Timestamp {
        NOW
    }

    fn service(shards: Vec<Arc<InMemoryShard>>) -> MetadataService {
        let group = StaticClusterGroup::new(
            "default",
            shards
                .into_iter()
                .map(|s| s as Arc<dyn ShardClient>)
                .collect(),
        );
        let cluster = ClusterManager::new("default").with_group(Arc::new(group));
        MetadataService::new(
            Arc::new(QueryGrammar),
            Arc::new(cluster),
            MetadataQueryCache::new(ClusterDispatch::new(), CacheConfig::default()),
        )
        .with_clock(fixed_now)
    }

    fn populated() -> Arc<InMemoryShard> {
        let shard = Arc::new(InMemoryShard::new("s0"));
        shard.insert(Series::new("cpu").with_tag("host", "a"), NOW - 1000);
        shard.insert(Series::new("cpu").with_tag("host", "b"), NOW - 2000);
        shard.insert(Series::new("mem").with_tag("host", "a"), NOW - 30 * DAY_MS);
        shard
    }

    #[test]
    fn test_with_query_collects_tokens() {
        let body = MetadataQueryBody::with_query(["host", "=", "a"]);
        assert_eq!(body.query, vec!["host", "=", "a"]);
        assert_eq!(body.range, RangeInput::default());
        assert_eq!(body.limit, None);

        let owned = MetadataQueryBody::with_query(vec![String::from("+role")]);
        assert_eq!(owned.query, vec!["+role"]);
    }

    #[test]
    fn test_range_filter_is_normalized() {
        let svc = service(vec![]);
        let rf = svc
            .range_filter(&MetadataQueryBody::with_query(["!", "!", "host", "=", "a", "and", "*"]))
            .unwrap();
        assert_eq!(rf.filter(), &FilterExpression::match_tag("host", "a"));
    }

    #[tokio::test]
    async fn test_empty_body_uses_default_range() {
        let svc = service(vec![populated()]);
        let outcome = svc.series_count(None, DispatchOptions::default()).await.unwrap();
        // mem was last seen 30 days ago, outside the 7 day default
        assert_eq!(outcome.result().map(|c| c.count), Some(2));
    }

    #[tokio::test]
    async fn test_query_tokens_and_literals() {
        let svc = service(vec![populated()]);
        let body = MetadataQueryBody {
            query: vec!["host".into(), "=".into(), "a".into()],
            range: RangeInput {
                start: Some(InstantInput::Literal(format!("-{}", 31 * DAY_MS))),
                end: Some(InstantInput::Millis(NOW)),
            },
            limit: None,
        };
        let outcome = svc.keys(Some(body), DispatchOptions::default()).await.unwrap();
        assert_eq!(outcome.result().unwrap().keys, vec!["cpu", "mem"]);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_dispatched() {
        let shard = populated();
        let svc = service(vec![shard.clone()]);

        let bad_literal = MetadataQueryBody {
            range: RangeInput {
                start: Some(InstantInput::Literal("not-a-time".into())),
                end: None,
            },
            ..Default::default()
        };
        let err = svc
            .tags(Some(bad_literal), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInstantLiteral(_)));

        let bad_filter = MetadataQueryBody::with_query(["host", "="]);
        let err = svc
            .tags(Some(bad_filter), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFilterSyntax { .. }));

        let bad_limit = MetadataQueryBody {
            limit: Some(0),
            ..Default::default()
        };
        let err = svc
            .series(Some(bad_limit), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRangeFilter(_)));

        assert_eq!(shard.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_default_group_is_cluster_failure() {
        let cluster = ClusterManager::new("missing");
        let svc = MetadataService::new(
            Arc::new(QueryGrammar),
            Arc::new(cluster),
            MetadataQueryCache::new(ClusterDispatch::new(), CacheConfig::default()),
        );
        let outcome = svc.keys(None, DispatchOptions::default()).await.unwrap();
        assert!(outcome.is_failed());
    }

    #[tokio::test]
    async fn test_delete_invalidates_cache() {
        let shard = populated();
        let svc = service(vec![shard.clone()]);

        let before = svc.keys(None, DispatchOptions::default()).await.unwrap();
        assert_eq!(before.result().unwrap().keys, vec!["cpu"]);

        let deleted = svc
            .delete_series(
                Some(MetadataQueryBody::with_query(["$key", "=", "cpu"])),
                DispatchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.result().map(|d| d.deleted), Some(2));

        let after = svc.keys(None, DispatchOptions::default()).await.unwrap();
        assert!(after.result().unwrap().keys.is_empty());
    }

    #[tokio::test]
    async fn test_add_series_then_visible() {
        let shard = populated();
        let svc = service(vec![shard.clone()]);

        let written = svc
            .add_series(Series::new("disk").with_tag("host", "c"), DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(written, AggregateOutcome::Succeeded(WriteResult { accepted: 1, rejected: 0 }));

        let count = svc.series_count(None, DispatchOptions::default()).await.unwrap();
        assert_eq!(count.result().map(|c| c.count), Some(3));

        assert!(svc
            .add_series(Series::new(""), DispatchOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_suggest_default_limit() {
        let shard = Arc::new(InMemoryShard::new("s0"));
        for i in 0..20 {
            shard.insert(Series::new(format!("key{:02}", i)), NOW);
        }
        let svc = service(vec![shard]);

        let outcome = svc.key_suggest(None, DispatchOptions::default()).await.unwrap();
        assert_eq!(outcome.result().unwrap().suggestions.len(), 10);
    }

    #[tokio::test]
    async fn test_partial_tolerance_through_service() {
        let failing = populated();
        failing.fail_with(Some(ShardError::Unavailable("down".into())));
        let svc = service(vec![populated(), failing]);

        let strict = svc.series_count(None, DispatchOptions::default()).await.unwrap();
        assert!(strict.is_failed());

        let tolerant = svc
            .series_count(None, DispatchOptions::default().with_partial_tolerance(true))
            .await
            .unwrap();
        assert_eq!(tolerant.failed_shards(), 1);
        assert_eq!(tolerant.result().map(|c| c.count), Some(2));
    }

    #[tokio::test]
    async fn test_handle_request_json() {
        let svc = service(vec![populated()]);
        let request: MetadataRequest = serde_json::from_str(
            r#"{"operation": "tag_values_suggest", "body": {"query": ["$key", "=", "cpu"], "group_limit": 1}}"#,
        )
        .unwrap();

        let outcome = svc.handle(request, DispatchOptions::default()).await.unwrap();
        match outcome.into_result() {
            Some(MetadataResult::TagValuesSuggest(result)) => {
                assert_eq!(result.suggestions[0].key, "host");
                assert_eq!(result.suggestions[0].values, vec!["a"]);
                assert!(result.suggestions[0].limited);
            }
            other => panic!("unexpected result {:?}", other),
        }

        let request: MetadataRequest =
            serde_json::from_str(r#"{"operation": "keys", "body": null}"#).unwrap();
        assert_eq!(request, MetadataRequest::Keys(None));
    }
}
