//! Deduplicating metadata query cache
//!
//! Autocomplete UIs fire the same enumeration query many times while a user
//! types. [`MetadataQueryCache`] keeps at most one cluster dispatch in flight
//! per [`Fingerprint`] and lets every concurrent identical caller attach to
//! it. Successful results are then kept for a bounded TTL in an LRU.
//!
//! # Example
//!
//! ```rust
//! use kuba_metadata::cache::{CacheConfig, MetadataQueryCache};
//! use kuba_metadata::cluster::{ClusterDispatch, ClusterGroup, DispatchOptions, InMemoryShard, MetadataQuery, ShardClient, StaticClusterGroup};
//! use kuba_metadata::filter::{FilterExpression, RangeFilter};
//! use kuba_metadata::types::{Series, TimeRange};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let shard = Arc::new(InMemoryShard::new("s0"));
//! shard.insert(Series::new("cpu").with_tag("host", "a"), 5);
//! let group: Arc<dyn ClusterGroup> =
//!     Arc::new(StaticClusterGroup::new("default", vec![shard.clone() as Arc<dyn ShardClient>]));
//!
//! let cache = MetadataQueryCache::new(ClusterDispatch::new(), CacheConfig::default());
//! let filter = RangeFilter::filter_for(FilterExpression::AlwaysTrue, TimeRange::new(0, 10).unwrap()).unwrap();
//! let query = MetadataQuery::FindKeys(filter);
//!
//! cache.get(group.clone(), query.clone(), DispatchOptions::default()).await;
//! cache.get(group.clone(), query, DispatchOptions::default()).await;
//!
//! assert_eq!(shard.calls(), 1);
//! assert_eq!(cache.stats().hits, 1);
//! # }
//! ```

mod query;

pub use query::MetadataQueryCache;

use crate::cluster::MetadataQuery;
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Cache Configuration
// ============================================================================

/// Configuration for the metadata query cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Enable cache (default: true)
    pub enabled: bool,

    /// Maximum number of completed entries (default: 10,000)
    pub max_entries: usize,

    /// Lifetime of a completed entry (default: 60 seconds)
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Set maximum entries
    pub fn with_max_entries(mut self, entries: usize) -> Self {
        self.max_entries = entries;
        self
    }

    /// Set entry TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Disable caching; every request dispatches
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ============================================================================
// Fingerprint
// ============================================================================

/// Identity of a cacheable request
///
/// Carries the full canonical key next to its hash. Tables hash on the
/// precomputed value but compare keys, so two requests whose hashes collide
/// still occupy separate entries.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    hash: u64,
    key: Arc<str>,
}

impl Fingerprint {
    /// Fingerprint of `query` against `group`
    ///
    /// Built from the canonical form of the normalized query, so filters that
    /// differ only in child order share a fingerprint. Partial tolerance is
    /// part of the identity: a strict caller never attaches to a tolerant
    /// dispatch.
    pub fn new(group: &str, query: &MetadataQuery, partial_tolerance: bool) -> Self {
        let key = format!(
            "{}:{} partial={} {}",
            group.len(),
            group,
            partial_tolerance,
            query.canonical()
        );
        Self::from_key(key)
    }

    fn from_key(key: String) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            key: key.into(),
        }
    }

    /// Hash value, used in logs
    pub fn value(&self) -> u64 {
        self.hash
    }

    /// Canonical key
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key == other.key
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Requests served from a completed entry
    pub hits: AtomicU64,

    /// Requests that started a dispatch
    pub misses: AtomicU64,

    /// Requests that attached to an in-flight dispatch
    pub attached: AtomicU64,

    /// Entries dropped by LRU pressure
    pub evictions: AtomicU64,

    /// Entries dropped after their TTL
    pub expirations: AtomicU64,
}

impl CacheStats {
    /// Point-in-time copy
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            attached: self.attached.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Requests served from a completed entry
    pub hits: u64,
    /// Requests that started a dispatch
    pub misses: u64,
    /// Requests that attached to an in-flight dispatch
    pub attached: u64,
    /// Entries dropped by LRU pressure
    pub evictions: u64,
    /// Entries dropped after their TTL
    pub expirations: u64,
}

impl CacheStatsSnapshot {
    /// Share of requests that avoided a dispatch (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let served = self.hits + self.attached;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
