//! Promise-sharing cache over cluster dispatch
//!
//! Two tables back the cache:
//!
//! - `pending`: fingerprint to the shared future of the dispatch in flight.
//!   Insertion goes through the `DashMap` entry API, so exactly one of many
//!   racing callers becomes the leader and the rest attach.
//! - `completed`: LRU of successful results with an expiry instant.
//!
//! The leader's dispatch runs as a spawned task. It settles the tables even
//! when every waiter has gone away: a successful result is stored first and
//! the pending slot is released afterwards, so a caller that misses the
//! pending slot always finds the stored result. Failures and partial results
//! reach every attached waiter but are never stored.

use super::{CacheConfig, CacheStats, CacheStatsSnapshot, Fingerprint};
use crate::cluster::{
    AggregateOutcome, ClusterDispatch, ClusterGroup, DispatchOptions, MetadataQuery,
    MetadataResult, OperationKind,
};
use crate::error::DispatchError;
use crate::metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type SharedOutcome = Shared<BoxFuture<'static, AggregateOutcome<MetadataResult>>>;

/// Dispatch in flight for one fingerprint
struct Pending {
    generation: u64,
    future: SharedOutcome,
}

/// Stored successful result
struct Completed {
    result: MetadataResult,
    expires_at: Instant,
}

struct CacheInner {
    dispatch: ClusterDispatch,
    config: CacheConfig,
    pending: DashMap<Fingerprint, Pending>,
    completed: Mutex<LruCache<Fingerprint, Completed>>,
    next_generation: AtomicU64,
    stats: CacheStats,
}

/// Deduplicating, TTL-bounded cache in front of cacheable operations
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct MetadataQueryCache {
    inner: Arc<CacheInner>,
}

impl MetadataQueryCache {
    /// Create a cache over `dispatch`
    pub fn new(dispatch: ClusterDispatch, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(CacheInner {
                dispatch,
                config,
                pending: DashMap::new(),
                completed: Mutex::new(LruCache::new(capacity)),
                next_generation: AtomicU64::new(0),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Resolve `query` against `group`, sharing in-flight work
    ///
    /// Non-cacheable operations and a disabled cache go straight to dispatch.
    /// The caller's cancellation token only abandons this caller's wait; the
    /// shared dispatch keeps running for the other waiters.
    pub async fn get(
        &self,
        group: Arc<dyn ClusterGroup>,
        query: MetadataQuery,
        options: DispatchOptions,
    ) -> AggregateOutcome<MetadataResult> {
        let kind = query.kind();
        if !self.inner.config.enabled || !kind.is_cacheable() {
            return self.inner.dispatch.execute(&*group, &query, &options).await;
        }

        let fingerprint = Fingerprint::new(group.name(), &query, options.partial_tolerance);

        if let Some(result) = self.inner.lookup(&fingerprint) {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_request(kind.as_str(), "hit");
            debug!(operation = %kind, fingerprint = fingerprint.value(), "Cache hit");
            return AggregateOutcome::Succeeded(result);
        }

        let caller_cancel = options.cancel.clone();

        let future = match self.inner.pending.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => {
                self.inner.stats.attached.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_request(kind.as_str(), "attached");
                debug!(operation = %kind, fingerprint = fingerprint.value(), "Attached to in-flight dispatch");
                entry.get().future.clone()
            }
            Entry::Vacant(entry) => {
                // A leader may have settled between the lookup above and here
                if let Some(result) = self.inner.lookup(&fingerprint) {
                    self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::record_cache_request(kind.as_str(), "hit");
                    return AggregateOutcome::Succeeded(result);
                }

                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_request(kind.as_str(), "miss");

                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let future = self.inner.lead(fingerprint, generation, kind, group, query, options);
                entry.insert(Pending {
                    generation,
                    future: future.clone(),
                });
                future
            }
        };

        match caller_cancel {
            Some(token) => tokio::select! {
                outcome = future => outcome,
                _ = token.cancelled() => AggregateOutcome::Failed(DispatchError::Cancelled),
            },
            None => future.await,
        }
    }

    /// Drop the entry and any in-flight dispatch for `fingerprint`
    ///
    /// A dispatch already running completes for its waiters but its result
    /// is not stored.
    pub fn invalidate(&self, fingerprint: Fingerprint) {
        self.inner.pending.remove(&fingerprint);
        let mut completed = self.inner.completed.lock();
        completed.pop(&fingerprint);
        metrics::update_cache_entries(completed.len());
    }

    /// Drop every entry
    pub fn invalidate_all(&self) {
        let pending = self.inner.pending.len();
        self.inner.pending.clear();

        let mut completed = self.inner.completed.lock();
        let stored = completed.len();
        completed.clear();
        metrics::update_cache_entries(0);

        info!(pending, stored, "Invalidated metadata cache");
    }

    /// Number of completed entries, expired ones included until touched
    pub fn len(&self) -> usize {
        self.inner.completed.lock().len()
    }

    /// True if no completed entries are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dispatches in flight
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for MetadataQueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataQueryCache")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl CacheInner {
    /// Fresh stored result, removing it if expired
    fn lookup(&self, fingerprint: &Fingerprint) -> Option<MetadataResult> {
        let mut completed = self.completed.lock();

        let expired = match completed.get(fingerprint) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.result.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            completed.pop(fingerprint);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            metrics::update_cache_entries(completed.len());
        }
        None
    }

    /// Spawn the leader dispatch and return its shared future
    fn lead(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        generation: u64,
        kind: OperationKind,
        group: Arc<dyn ClusterGroup>,
        query: MetadataQuery,
        mut options: DispatchOptions,
    ) -> SharedOutcome {
        // Waiters cancel individually; the shared dispatch answers to nobody's token
        options.cancel = None;

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _release = PendingRelease {
                inner: Arc::clone(&inner),
                fingerprint: fingerprint.clone(),
                generation,
            };
            let outcome = inner.dispatch.execute(&*group, &query, &options).await;
            inner.settle(&fingerprint, generation, kind, &outcome);
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(operation = %kind, error = %err, "Cached dispatch task failed");
                    AggregateOutcome::Failed(DispatchError::Cancelled)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Store a successful outcome if this dispatch is still current
    fn settle(
        &self,
        fingerprint: &Fingerprint,
        generation: u64,
        kind: OperationKind,
        outcome: &AggregateOutcome<MetadataResult>,
    ) {
        let AggregateOutcome::Succeeded(result) = outcome else {
            debug!(operation = %kind, outcome = outcome.label(), "Not caching unsuccessful dispatch");
            return;
        };

        let Some(pending) = self.pending.get(fingerprint) else {
            return;
        };
        if pending.generation != generation {
            return;
        }

        let mut completed = self.completed.lock();
        let entry = Completed {
            result: result.clone(),
            expires_at: Instant::now() + self.config.ttl,
        };
        if let Some((evicted, _)) = completed.push(fingerprint.clone(), entry) {
            if evicted != *fingerprint {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        metrics::update_cache_entries(completed.len());
    }
}

/// Frees the pending slot when the leader task ends, panics included
struct PendingRelease {
    inner: Arc<CacheInner>,
    fingerprint: Fingerprint,
    generation: u64,
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        let generation = self.generation;
        self.inner
            .pending
            .remove_if(&self.fingerprint, |_, pending| pending.generation == generation);
    }
}
