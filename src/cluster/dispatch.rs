//! Cluster fan-out and aggregation
//!
//! [`ClusterDispatch`] sends one operation to every shard of a group, merges
//! the responses as they arrive and settles into exactly one
//! [`AggregateOutcome`].
//!
//! # Failure policy
//!
//! - **Fail-fast by default**: the first shard failure settles the aggregate
//!   as `Failed(ShardFailure)` and every other pending shard call is dropped.
//! - **Partial tolerance** is an explicit per-call opt-in through
//!   [`DispatchOptions::with_partial_tolerance`]. It applies to reads only;
//!   delete and write stay strict.
//! - **Deadline**: a dispatch that has not settled in time becomes
//!   `Failed(Timeout)`, or `PartialFailure` when tolerance is on and at least
//!   one shard answered.
//! - **Cancellation**: firing the token, or dropping the future, drops every
//!   pending shard call. Nothing that arrives later is merged.
//!
//! Responses are slotted by shard index, so each shard contributes at most
//! once and the merge sees shards in index order regardless of arrival order.
//!
//! # Example
//!
//! ```rust
//! use kuba_metadata::cluster::{ClusterDispatch, DispatchOptions, InMemoryShard, ShardClient, StaticClusterGroup};
//! use kuba_metadata::filter::{FilterExpression, RangeFilter};
//! use kuba_metadata::types::{Series, TimeRange};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let shard = Arc::new(InMemoryShard::new("shard-0"));
//! shard.insert(Series::new("cpu").with_tag("host", "a"), 10);
//!
//! let group = StaticClusterGroup::new("default", vec![shard as Arc<dyn ShardClient>]);
//! let filter = RangeFilter::filter_for(FilterExpression::AlwaysTrue, TimeRange::new(0, 100).unwrap()).unwrap();
//!
//! let outcome = ClusterDispatch::new()
//!     .count_series(&group, &filter, &DispatchOptions::default())
//!     .await;
//! assert_eq!(outcome.result().map(|c| c.count), Some(1));
//! # }
//! ```

use super::merge;
use super::query::{MatchOptions, MetadataQuery, OperationKind};
use super::results::*;
use super::{ClusterGroup, ShardClient, ShardResult};
use crate::error::{DispatchError, ShardError};
use crate::filter::RangeFilter;
use crate::metrics;
use crate::types::{Series, TimeRange};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

/// Default time allowed for a dispatch to settle
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

// ============================================================================
// Options
// ============================================================================

/// Per-call dispatch settings
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Time allowed before the aggregate settles as a timeout
    pub deadline: Duration,

    /// Accept results from a subset of shards (reads only)
    pub partial_tolerance: bool,

    /// External cancellation
    pub cancel: Option<CancellationToken>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            partial_tolerance: false,
            cancel: None,
        }
    }
}

impl DispatchOptions {
    /// Set the deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Opt into partial results
    pub fn with_partial_tolerance(mut self, tolerant: bool) -> Self {
        self.partial_tolerance = tolerant;
        self
    }

    /// Attach a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Terminal state of one dispatched query
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome<T> {
    /// Every shard answered
    Succeeded(T),

    /// Result built from the shards that answered
    PartialFailure {
        /// Merge of the answers that arrived
        result: T,
        /// Shards that failed or did not answer in time
        failed_shards: usize,
    },

    /// No usable result
    Failed(DispatchError),
}

impl<T> AggregateOutcome<T> {
    /// Transform the carried result
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AggregateOutcome<U> {
        match self {
            AggregateOutcome::Succeeded(result) => AggregateOutcome::Succeeded(f(result)),
            AggregateOutcome::PartialFailure {
                result,
                failed_shards,
            } => AggregateOutcome::PartialFailure {
                result: f(result),
                failed_shards,
            },
            AggregateOutcome::Failed(err) => AggregateOutcome::Failed(err),
        }
    }

    /// Fallible transform of the carried result
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<AggregateOutcome<U>, E> {
        Ok(match self {
            AggregateOutcome::Succeeded(result) => AggregateOutcome::Succeeded(f(result)?),
            AggregateOutcome::PartialFailure {
                result,
                failed_shards,
            } => AggregateOutcome::PartialFailure {
                result: f(result)?,
                failed_shards,
            },
            AggregateOutcome::Failed(err) => AggregateOutcome::Failed(err),
        })
    }

    /// Result of a complete or partial aggregate
    pub fn result(&self) -> Option<&T> {
        match self {
            AggregateOutcome::Succeeded(result)
            | AggregateOutcome::PartialFailure { result, .. } => Some(result),
            AggregateOutcome::Failed(_) => None,
        }
    }

    /// Owned form of [`AggregateOutcome::result`]
    pub fn into_result(self) -> Option<T> {
        match self {
            AggregateOutcome::Succeeded(result)
            | AggregateOutcome::PartialFailure { result, .. } => Some(result),
            AggregateOutcome::Failed(_) => None,
        }
    }

    /// Failure cause, if failed
    pub fn error(&self) -> Option<&DispatchError> {
        match self {
            AggregateOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Number of shards missing from a partial result
    pub fn failed_shards(&self) -> usize {
        match self {
            AggregateOutcome::PartialFailure { failed_shards, .. } => *failed_shards,
            _ => 0,
        }
    }

    /// Every shard answered
    pub fn is_succeeded(&self) -> bool {
        matches!(self, AggregateOutcome::Succeeded(_))
    }

    /// Some shards answered under partial tolerance
    pub fn is_partial(&self) -> bool {
        matches!(self, AggregateOutcome::PartialFailure { .. })
    }

    /// No usable result
    pub fn is_failed(&self) -> bool {
        matches!(self, AggregateOutcome::Failed(_))
    }

    /// Label used in metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            AggregateOutcome::Succeeded(_) => "succeeded",
            AggregateOutcome::PartialFailure { .. } => "partial",
            AggregateOutcome::Failed(_) => "failed",
        }
    }
}

impl<T: Serialize> Serialize for AggregateOutcome<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AggregateOutcome::Succeeded(result) => {
                let mut s = serializer.serialize_struct("AggregateOutcome", 2)?;
                s.serialize_field("outcome", self.label())?;
                s.serialize_field("result", result)?;
                s.end()
            }
            AggregateOutcome::PartialFailure {
                result,
                failed_shards,
            } => {
                let mut s = serializer.serialize_struct("AggregateOutcome", 3)?;
                s.serialize_field("outcome", self.label())?;
                s.serialize_field("result", result)?;
                s.serialize_field("failed_shards", failed_shards)?;
                s.end()
            }
            AggregateOutcome::Failed(err) => {
                let mut s = serializer.serialize_struct("AggregateOutcome", 2)?;
                s.serialize_field("outcome", self.label())?;
                s.serialize_field("error", &err.to_string())?;
                s.end()
            }
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Fans operations out to cluster groups
#[derive(Debug, Clone, Default)]
pub struct ClusterDispatch;

impl ClusterDispatch {
    /// Create a dispatcher
    pub fn new() -> Self {
        Self
    }

    /// Dispatch any query and wrap the result
    pub async fn execute(
        &self,
        group: &dyn ClusterGroup,
        query: &MetadataQuery,
        options: &DispatchOptions,
    ) -> AggregateOutcome<MetadataResult> {
        match query {
            MetadataQuery::FindTags(filter) => {
                self.find_tags(group, filter, options).await.map(Into::into)
            }
            MetadataQuery::FindKeys(filter) => {
                self.find_keys(group, filter, options).await.map(Into::into)
            }
            MetadataQuery::FindSeries(filter) => {
                self.find_series(group, filter, options).await.map(Into::into)
            }
            MetadataQuery::CountSeries(filter) => {
                self.count_series(group, filter, options).await.map(Into::into)
            }
            MetadataQuery::DeleteSeries(filter) => {
                self.delete_series(group, filter, options).await.map(Into::into)
            }
            MetadataQuery::TagKeyCount(filter) => {
                self.tag_key_count(group, filter, options).await.map(Into::into)
            }
            MetadataQuery::KeySuggest {
                filter,
                options: match_options,
                key,
            } => self
                .key_suggest(group, filter, match_options, key.as_deref(), options)
                .await
                .map(Into::into),
            MetadataQuery::TagSuggest {
                filter,
                options: match_options,
                key,
                value,
            } => self
                .tag_suggest(
                    group,
                    filter,
                    match_options,
                    key.as_deref(),
                    value.as_deref(),
                    options,
                )
                .await
                .map(Into::into),
            MetadataQuery::TagValueSuggest { filter, key } => self
                .tag_value_suggest(group, filter, key.as_deref(), options)
                .await
                .map(Into::into),
            MetadataQuery::TagValuesSuggest {
                filter,
                exclude,
                group_limit,
            } => self
                .tag_values_suggest(group, filter, exclude, *group_limit, options)
                .await
                .map(Into::into),
            MetadataQuery::WriteSeries { range, series } => self
                .write_series(group, range, series, options)
                .await
                .map(Into::into),
        }
    }

    /// Tag keys and values across the group
    pub async fn find_tags(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        options: &DispatchOptions,
    ) -> AggregateOutcome<FindTags> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::FindTags,
            options,
            |shard| shard.find_tags(filter),
            |parts| merge::find_tags(parts, filter),
        )
        .await
    }

    /// Distinct series keys across the group
    pub async fn find_keys(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        options: &DispatchOptions,
    ) -> AggregateOutcome<FindKeys> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::FindKeys,
            options,
            |shard| shard.find_keys(filter),
            |parts| merge::find_keys(parts, filter),
        )
        .await
    }

    /// Matching series across the group
    pub async fn find_series(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        options: &DispatchOptions,
    ) -> AggregateOutcome<FindSeries> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::FindSeries,
            options,
            |shard| shard.find_series(filter),
            |parts| merge::find_series(parts, filter),
        )
        .await
    }

    /// Summed series count
    pub async fn count_series(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        options: &DispatchOptions,
    ) -> AggregateOutcome<CountSeries> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::CountSeries,
            options,
            |shard| shard.count_series(filter),
            merge::count_series,
        )
        .await
    }

    /// Delete from every shard
    ///
    /// Succeeds only if every shard acknowledges. Shards that answered before
    /// a failure keep their deletions; retrying the whole call is safe.
    pub async fn delete_series(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        options: &DispatchOptions,
    ) -> AggregateOutcome<DeleteSeries> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::DeleteSeries,
            options,
            |shard| shard.delete_series(filter),
            merge::delete_series,
        )
        .await
    }

    /// Tag key counts summed per key
    pub async fn tag_key_count(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        options: &DispatchOptions,
    ) -> AggregateOutcome<TagKeyCount> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::TagKeyCount,
            options,
            |shard| shard.tag_key_count(filter),
            |parts| merge::tag_key_count(parts, filter),
        )
        .await
    }

    /// Series key suggestions ranked by summed score
    pub async fn key_suggest(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        match_options: &MatchOptions,
        key: Option<&str>,
        options: &DispatchOptions,
    ) -> AggregateOutcome<KeySuggest> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::KeySuggest,
            options,
            |shard| shard.key_suggest(filter, match_options, key),
            |parts| merge::key_suggest(parts, filter),
        )
        .await
    }

    /// Tag suggestions ranked by summed score
    pub async fn tag_suggest(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        match_options: &MatchOptions,
        key: Option<&str>,
        value: Option<&str>,
        options: &DispatchOptions,
    ) -> AggregateOutcome<TagSuggest> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::TagSuggest,
            options,
            |shard| shard.tag_suggest(filter, match_options, key, value),
            |parts| merge::tag_suggest(parts, filter),
        )
        .await
    }

    /// Values of one tag key, most widely reported first
    pub async fn tag_value_suggest(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        key: Option<&str>,
        options: &DispatchOptions,
    ) -> AggregateOutcome<TagValueSuggest> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::TagValueSuggest,
            options,
            |shard| shard.tag_value_suggest(filter, key),
            |parts| merge::tag_value_suggest(parts, filter),
        )
        .await
    }

    /// Values grouped by tag key
    pub async fn tag_values_suggest(
        &self,
        group: &dyn ClusterGroup,
        filter: &RangeFilter,
        exclude: &[String],
        group_limit: usize,
        options: &DispatchOptions,
    ) -> AggregateOutcome<TagValuesSuggest> {
        fan_out(
            group.name(),
            group.shards(),
            OperationKind::TagValuesSuggest,
            options,
            |shard| shard.tag_values_suggest(filter, exclude, group_limit),
            |parts| merge::tag_values_suggest(parts, filter, group_limit),
        )
        .await
    }

    /// Write to the shard that owns `series`
    pub async fn write_series(
        &self,
        group: &dyn ClusterGroup,
        range: &TimeRange,
        series: &Series,
        options: &DispatchOptions,
    ) -> AggregateOutcome<WriteResult> {
        let Some(owner) = group.route(series) else {
            return AggregateOutcome::Failed(DispatchError::EmptyGroup(group.name().to_string()));
        };

        fan_out(
            group.name(),
            std::slice::from_ref(owner),
            OperationKind::WriteSeries,
            options,
            |shard| shard.write_series(range, series),
            |parts| parts.into_iter().next().unwrap_or_default(),
        )
        .await
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// Drive `call` on every shard and fold the responses with `merge`
async fn fan_out<'a, T, C, M>(
    group: &'a str,
    shards: &'a [Arc<dyn ShardClient>],
    operation: OperationKind,
    options: &'a DispatchOptions,
    call: C,
    merge: M,
) -> AggregateOutcome<T>
where
    T: Send + 'a,
    C: Fn(&'a dyn ShardClient) -> BoxFuture<'a, ShardResult<T>>,
    M: FnOnce(Vec<T>) -> T,
{
    let span = tracing::debug_span!(
        "dispatch",
        operation = operation.as_str(),
        group = group,
        shards = shards.len()
    );

    async move {
        let started = Instant::now();
        let outcome = collect(group, shards, operation, options, call, merge).await;
        metrics::record_dispatch(
            operation.as_str(),
            outcome.label(),
            started.elapsed().as_secs_f64(),
        );
        debug!(outcome = outcome.label(), "Dispatch settled");
        outcome
    }
    .instrument(span)
    .await
}

async fn collect<'a, T, C, M>(
    group: &'a str,
    shards: &'a [Arc<dyn ShardClient>],
    operation: OperationKind,
    options: &'a DispatchOptions,
    call: C,
    merge: M,
) -> AggregateOutcome<T>
where
    T: Send + 'a,
    C: Fn(&'a dyn ShardClient) -> BoxFuture<'a, ShardResult<T>>,
    M: FnOnce(Vec<T>) -> T,
{
    if shards.is_empty() {
        return AggregateOutcome::Failed(DispatchError::EmptyGroup(group.to_string()));
    }

    let tolerant = options.partial_tolerance && operation.allows_partial();

    let mut pending: FuturesUnordered<_> = shards
        .iter()
        .enumerate()
        .map(|(index, shard)| {
            let response = call(shard.as_ref());
            async move { (index, response.await) }
        })
        .collect();

    let mut slots: Vec<Option<T>> = shards.iter().map(|_| None).collect();
    let mut failures: Vec<(usize, ShardError)> = Vec::new();

    let deadline = tokio::time::sleep(options.deadline);
    tokio::pin!(deadline);

    let cancelled = async {
        match &options.cancel {
            Some(token) => token.cancelled().await,
            None => futures::future::pending::<()>().await,
        }
    };
    tokio::pin!(cancelled);

    loop {
        tokio::select! {
            biased;

            _ = &mut cancelled => {
                warn!(unfinished = pending.len(), "Dispatch cancelled");
                return AggregateOutcome::Failed(DispatchError::Cancelled);
            }

            _ = &mut deadline => {
                let answered = slots.iter().filter(|s| s.is_some()).count();
                warn!(
                    answered,
                    failed = failures.len(),
                    unfinished = pending.len(),
                    deadline_ms = options.deadline.as_millis() as u64,
                    "Dispatch deadline exceeded"
                );

                if tolerant && answered > 0 {
                    let failed_shards = shards.len() - answered;
                    let parts = slots.into_iter().flatten().collect();
                    return AggregateOutcome::PartialFailure {
                        result: merge(parts),
                        failed_shards,
                    };
                }
                return AggregateOutcome::Failed(DispatchError::Timeout {
                    deadline: options.deadline,
                });
            }

            next = pending.next() => match next {
                None => break,
                Some((index, Ok(response))) => {
                    debug!(shard = shards[index].id(), "Shard answered");
                    if slots[index].is_none() {
                        slots[index] = Some(response);
                    }
                }
                Some((index, Err(source))) => {
                    let shard = shards[index].id().to_string();
                    warn!(shard = %shard, error = %source, "Shard failed");
                    metrics::record_shard_failure(operation.as_str());

                    if !tolerant {
                        return AggregateOutcome::Failed(DispatchError::ShardFailure { shard, source });
                    }
                    failures.push((index, source));
                }
            }
        }
    }

    let parts: Vec<T> = slots.into_iter().flatten().collect();

    if failures.is_empty() {
        return AggregateOutcome::Succeeded(merge(parts));
    }

    if parts.is_empty() {
        let (index, source) = failures.swap_remove(0);
        return AggregateOutcome::Failed(DispatchError::ShardFailure {
            shard: shards[index].id().to_string(),
            source,
        });
    }

    AggregateOutcome::PartialFailure {
        result: merge(parts),
        failed_shards: failures.len(),
    }
}
