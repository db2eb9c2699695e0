//! Cluster groups, shards and fan-out
//!
//! A cluster group is a set of shards that together own the whole metadata
//! index. Reads fan out to every shard in the group; writes go to the single
//! shard that owns the series.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   use_group()   ┌──────────────────┐
//! │  ClusterManager  │ ──────────────> │   ClusterGroup   │
//! └──────────────────┘                 └────────┬─────────┘
//!                                               │ shards()
//!                       ┌───────────────────────┼───────────────────────┐
//!                       ▼                       ▼                       ▼
//!                ┌─────────────┐         ┌─────────────┐         ┌─────────────┐
//!                │ ShardClient │         │ ShardClient │         │ ShardClient │
//!                └─────────────┘         └─────────────┘         └─────────────┘
//! ```
//!
//! [`dispatch::ClusterDispatch`] drives the fan-out and merges responses with
//! the policies in [`merge`].

pub mod dispatch;
pub mod memory;
pub mod merge;
pub mod query;
pub mod results;

pub use dispatch::{AggregateOutcome, ClusterDispatch, DispatchOptions};
pub use memory::InMemoryShard;
pub use query::{MatchOptions, MetadataQuery, OperationKind};
pub use results::*;

use crate::error::{DispatchError, ShardError};
use crate::filter::RangeFilter;
use crate::types::{Series, TimeRange};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Result of a single shard call
pub type ShardResult<T> = std::result::Result<T, ShardError>;

// ============================================================================
// Shard capability
// ============================================================================

/// One backend shard of the metadata index
///
/// Every method answers for this shard alone. Retrying individual calls is
/// the implementation's business; the dispatcher never retries.
#[async_trait]
pub trait ShardClient: Send + Sync + 'static {
    /// Identifier used in errors and logs
    fn id(&self) -> &str;

    /// Tag keys and values of matching series
    async fn find_tags(&self, filter: &RangeFilter) -> ShardResult<FindTags>;

    /// Distinct keys of matching series
    async fn find_keys(&self, filter: &RangeFilter) -> ShardResult<FindKeys>;

    /// Matching series identities
    async fn find_series(&self, filter: &RangeFilter) -> ShardResult<FindSeries>;

    /// Number of matching series
    async fn count_series(&self, filter: &RangeFilter) -> ShardResult<CountSeries>;

    /// Remove matching series
    async fn delete_series(&self, filter: &RangeFilter) -> ShardResult<DeleteSeries>;

    /// Series count per tag key
    async fn tag_key_count(&self, filter: &RangeFilter) -> ShardResult<TagKeyCount>;

    /// Series keys similar to `key`
    async fn key_suggest(
        &self,
        filter: &RangeFilter,
        options: &MatchOptions,
        key: Option<&str>,
    ) -> ShardResult<KeySuggest>;

    /// Tag pairs similar to `key` / `value`
    async fn tag_suggest(
        &self,
        filter: &RangeFilter,
        options: &MatchOptions,
        key: Option<&str>,
        value: Option<&str>,
    ) -> ShardResult<TagSuggest>;

    /// Values of tag `key`
    async fn tag_value_suggest(
        &self,
        filter: &RangeFilter,
        key: Option<&str>,
    ) -> ShardResult<TagValueSuggest>;

    /// Values grouped by tag key, skipping `exclude`
    async fn tag_values_suggest(
        &self,
        filter: &RangeFilter,
        exclude: &[String],
        group_limit: usize,
    ) -> ShardResult<TagValuesSuggest>;

    /// Record `series` as active during `range`
    async fn write_series(&self, range: &TimeRange, series: &Series) -> ShardResult<WriteResult>;
}

// ============================================================================
// Cluster groups
// ============================================================================

/// Addressable set of shards
pub trait ClusterGroup: Send + Sync {
    /// Group name
    fn name(&self) -> &str;

    /// Every shard in the group
    fn shards(&self) -> &[Arc<dyn ShardClient>];

    /// The shard owning `series`, `None` for an empty group
    ///
    /// The default routes by [`Series::stable_hash`] so every node agrees on
    /// ownership.
    fn route(&self, series: &Series) -> Option<&Arc<dyn ShardClient>> {
        let shards = self.shards();
        if shards.is_empty() {
            return None;
        }
        let index = (series.stable_hash() % shards.len() as u64) as usize;
        shards.get(index)
    }
}

/// Group with a fixed shard list
pub struct StaticClusterGroup {
    name: String,
    shards: Vec<Arc<dyn ShardClient>>,
}

impl StaticClusterGroup {
    /// Create a group over `shards`
    pub fn new(name: impl Into<String>, shards: Vec<Arc<dyn ShardClient>>) -> Self {
        Self {
            name: name.into(),
            shards,
        }
    }
}

impl ClusterGroup for StaticClusterGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn shards(&self) -> &[Arc<dyn ShardClient>] {
        &self.shards
    }
}

impl std::fmt::Debug for StaticClusterGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticClusterGroup")
            .field("name", &self.name)
            .field(
                "shards",
                &self.shards.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Named cluster groups with a default
pub struct ClusterManager {
    groups: HashMap<String, Arc<dyn ClusterGroup>>,
    default_group: String,
}

impl ClusterManager {
    /// Create a manager whose default group is `default_group`
    pub fn new(default_group: impl Into<String>) -> Self {
        Self {
            groups: HashMap::new(),
            default_group: default_group.into(),
        }
    }

    /// Register a group, replacing any group with the same name
    pub fn add_group(&mut self, group: Arc<dyn ClusterGroup>) {
        info!(
            group = group.name(),
            shards = group.shards().len(),
            "Registered cluster group"
        );
        self.groups.insert(group.name().to_string(), group);
    }

    /// Builder form of [`ClusterManager::add_group`]
    pub fn with_group(mut self, group: Arc<dyn ClusterGroup>) -> Self {
        self.add_group(group);
        self
    }

    /// Name of the default group
    pub fn default_group_name(&self) -> &str {
        &self.default_group
    }

    /// The default group
    pub fn use_default_group(&self) -> Result<Arc<dyn ClusterGroup>, DispatchError> {
        self.use_group(&self.default_group)
    }

    /// A group by name
    pub fn use_group(&self, name: &str) -> Result<Arc<dyn ClusterGroup>, DispatchError> {
        self.groups
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownGroup(name.to_string()))
    }

    /// Registered group names, sorted
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }
}
