//! Cluster Dispatch and Cache Integration Tests
//!
//! Drives the public dispatch and cache APIs against custom shard clients
//! to check merge results, failure handling and request deduplication.

use async_trait::async_trait;
use kuba_metadata::cache::{CacheConfig, MetadataQueryCache};
use kuba_metadata::cluster::*;
use kuba_metadata::error::{DispatchError, ShardError};
use kuba_metadata::filter::{FilterExpression, RangeFilter};
use kuba_metadata::types::{Series, TimeRange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Scripted shard
// =============================================================================

/// Shard answering key suggestions from a fixed score table
struct ScriptedShard {
    id: String,
    scores: Vec<(&'static str, f64)>,
    delay: Duration,
    failure: Option<ShardError>,
    calls: AtomicU64,
}

impl ScriptedShard {
    fn new(id: &str, scores: Vec<(&'static str, f64)>) -> Self {
        Self {
            id: id.to_string(),
            scores,
            delay: Duration::ZERO,
            failure: None,
            calls: AtomicU64::new(0),
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self, err: ShardError) -> Self {
        self.failure = Some(err);
        self
    }

    async fn enter(&self) -> ShardResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ShardClient for ScriptedShard {
    fn id(&self) -> &str {
        &self.id
    }

    async fn find_tags(&self, _: &RangeFilter) -> ShardResult<FindTags> {
        self.enter().await?;
        Ok(FindTags::default())
    }

    async fn find_keys(&self, _: &RangeFilter) -> ShardResult<FindKeys> {
        self.enter().await?;
        let keys: Vec<String> = self.scores.iter().map(|(k, _)| k.to_string()).collect();
        Ok(FindKeys {
            size: keys.len(),
            keys,
            limited: false,
        })
    }

    async fn find_series(&self, _: &RangeFilter) -> ShardResult<FindSeries> {
        self.enter().await?;
        Ok(FindSeries::default())
    }

    async fn count_series(&self, _: &RangeFilter) -> ShardResult<CountSeries> {
        self.enter().await?;
        Ok(CountSeries {
            count: self.scores.len() as u64,
            limited: false,
        })
    }

    async fn delete_series(&self, _: &RangeFilter) -> ShardResult<DeleteSeries> {
        self.enter().await?;
        Ok(DeleteSeries {
            deleted: 1,
            acknowledged: 1,
        })
    }

    async fn tag_key_count(&self, _: &RangeFilter) -> ShardResult<TagKeyCount> {
        self.enter().await?;
        Ok(TagKeyCount::default())
    }

    async fn key_suggest(
        &self,
        _: &RangeFilter,
        _: &MatchOptions,
        _: Option<&str>,
    ) -> ShardResult<KeySuggest> {
        self.enter().await?;
        Ok(KeySuggest {
            suggestions: self
                .scores
                .iter()
                .map(|(key, score)| KeySuggestion {
                    key: key.to_string(),
                    score: *score,
                })
                .collect(),
        })
    }

    async fn tag_suggest(
        &self,
        _: &RangeFilter,
        _: &MatchOptions,
        _: Option<&str>,
        _: Option<&str>,
    ) -> ShardResult<TagSuggest> {
        self.enter().await?;
        Ok(TagSuggest::default())
    }

    async fn tag_value_suggest(
        &self,
        _: &RangeFilter,
        _: Option<&str>,
    ) -> ShardResult<TagValueSuggest> {
        self.enter().await?;
        Ok(TagValueSuggest::default())
    }

    async fn tag_values_suggest(
        &self,
        _: &RangeFilter,
        _: &[String],
        _: usize,
    ) -> ShardResult<TagValuesSuggest> {
        self.enter().await?;
        Ok(TagValuesSuggest::default())
    }

    async fn write_series(&self, _: &TimeRange, _: &Series) -> ShardResult<WriteResult> {
        self.enter().await?;
        Ok(WriteResult {
            accepted: 1,
            rejected: 0,
        })
    }
}

fn group(shards: Vec<Arc<ScriptedShard>>) -> Arc<dyn ClusterGroup> {
    Arc::new(StaticClusterGroup::new(
        "default",
        shards
            .into_iter()
            .map(|s| s as Arc<dyn ShardClient>)
            .collect(),
    ))
}

fn key_suggest_query(limit: Option<usize>) -> MetadataQuery {
    MetadataQuery::KeySuggest {
        filter: RangeFilter::new(
            FilterExpression::AlwaysTrue,
            TimeRange::new(0, 100).unwrap(),
            limit,
        )
        .unwrap(),
        options: MatchOptions::default(),
        key: None,
    }
}

fn keys(outcome: &AggregateOutcome<MetadataResult>) -> Vec<(String, f64)> {
    match outcome.result() {
        Some(MetadataResult::KeySuggest(result)) => result
            .suggestions
            .iter()
            .map(|s| (s.key.clone(), s.score))
            .collect(),
        other => panic!("unexpected result {:?}", other),
    }
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_scored_merge_across_shards() {
    let g = group(vec![
        Arc::new(ScriptedShard::new("s0", vec![("a", 3.0), ("b", 1.0)])),
        Arc::new(ScriptedShard::new("s1", vec![("a", 2.0), ("c", 5.0)])),
    ]);

    let outcome = ClusterDispatch::new()
        .execute(&*g, &key_suggest_query(Some(2)), &DispatchOptions::default())
        .await;

    assert!(outcome.is_succeeded());
    assert_eq!(
        keys(&outcome),
        vec![("c".to_string(), 5.0), ("a".to_string(), 5.0)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_shard_under_tolerance() {
    let g = group(vec![
        Arc::new(ScriptedShard::new("fast", vec![("a", 1.0)])),
        Arc::new(ScriptedShard::new("slow", vec![("b", 1.0)]).delayed(Duration::from_secs(60))),
    ]);

    let options = DispatchOptions::default()
        .with_deadline(Duration::from_secs(1))
        .with_partial_tolerance(true);
    let outcome = ClusterDispatch::new()
        .execute(&*g, &key_suggest_query(None), &options)
        .await;

    assert!(outcome.is_partial());
    assert_eq!(outcome.failed_shards(), 1);
    assert_eq!(keys(&outcome), vec![("a".to_string(), 1.0)]);

    let strict = ClusterDispatch::new()
        .execute(
            &*g,
            &key_suggest_query(None),
            &DispatchOptions::default().with_deadline(Duration::from_secs(1)),
        )
        .await;
    assert_eq!(
        strict.error(),
        Some(&DispatchError::Timeout {
            deadline: Duration::from_secs(1)
        })
    );
}

#[tokio::test]
async fn test_delete_ignores_tolerance() {
    let g = group(vec![
        Arc::new(ScriptedShard::new("ok", vec![])),
        Arc::new(
            ScriptedShard::new("down", vec![])
                .failing(ShardError::Unavailable("connection refused".into())),
        ),
    ]);

    let outcome = ClusterDispatch::new()
        .delete_series(
            &*g,
            &RangeFilter::filter_for(FilterExpression::AlwaysTrue, TimeRange::new(0, 1).unwrap())
                .unwrap(),
            &DispatchOptions::default().with_partial_tolerance(true),
        )
        .await;

    match outcome {
        AggregateOutcome::Failed(DispatchError::ShardFailure { shard, .. }) => {
            assert_eq!(shard, "down")
        }
        other => panic!("expected shard failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_group() {
    let g = group(vec![]);
    let outcome = ClusterDispatch::new()
        .execute(&*g, &key_suggest_query(None), &DispatchOptions::default())
        .await;
    assert_eq!(
        outcome.error(),
        Some(&DispatchError::EmptyGroup("default".into()))
    );
}

// =============================================================================
// Cache
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_dispatch() {
    let shards = vec![
        Arc::new(ScriptedShard::new("s0", vec![("a", 1.0)]).delayed(Duration::from_millis(50))),
        Arc::new(ScriptedShard::new("s1", vec![("b", 2.0)]).delayed(Duration::from_millis(50))),
    ];
    let g = group(shards.clone());
    let cache = MetadataQueryCache::new(ClusterDispatch::new(), CacheConfig::default());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            let g = g.clone();
            tokio::spawn(async move {
                cache
                    .get(g, key_suggest_query(None), DispatchOptions::default())
                    .await
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(
            keys(&outcome),
            vec![("b".to_string(), 2.0), ("a".to_string(), 1.0)]
        );
    }

    for shard in &shards {
        assert_eq!(shard.calls.load(Ordering::SeqCst), 1);
    }

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits + stats.attached, 15);
    assert_eq!(cache.pending(), 0);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_partial_results_are_not_cached() {
    let shards = vec![
        Arc::new(ScriptedShard::new("ok", vec![("a", 1.0)])),
        Arc::new(ScriptedShard::new("down", vec![]).failing(ShardError::Internal("boom".into()))),
    ];
    let g = group(shards.clone());
    let cache = MetadataQueryCache::new(ClusterDispatch::new(), CacheConfig::default());
    let tolerant = DispatchOptions::default().with_partial_tolerance(true);

    let first = cache
        .get(g.clone(), key_suggest_query(None), tolerant.clone())
        .await;
    assert!(first.is_partial());
    assert!(cache.is_empty());

    let second = cache.get(g, key_suggest_query(None), tolerant).await;
    assert!(second.is_partial());
    assert_eq!(shards[0].calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_strict_and_tolerant_callers_are_separate() {
    let shards = vec![
        Arc::new(ScriptedShard::new("ok", vec![("a", 1.0)])),
        Arc::new(ScriptedShard::new("down", vec![]).failing(ShardError::Rejected("quota".into()))),
    ];
    let g = group(shards);
    let cache = MetadataQueryCache::new(ClusterDispatch::new(), CacheConfig::default());

    let tolerant = cache
        .get(
            g.clone(),
            key_suggest_query(None),
            DispatchOptions::default().with_partial_tolerance(true),
        )
        .await;
    let strict = cache
        .get(g, key_suggest_query(None), DispatchOptions::default())
        .await;

    assert!(tolerant.is_partial());
    assert!(strict.is_failed());
}
