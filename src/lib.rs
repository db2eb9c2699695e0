//! Kuba Metadata - series metadata queries over a sharded cluster
//!
//! This library resolves metadata requests (tag and key enumeration, series
//! lookup, counts, deletes and suggestions) against every shard of a cluster
//! group and merges the answers:
//! - Temporal literal resolution for range bounds
//! - Filter expressions with a pluggable query grammar
//! - Deadline-bounded fan-out with opt-in partial results
//! - A deduplicating TTL cache for autocomplete-style traffic

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Temporal literal resolution
pub mod time;

/// Filter expressions, query grammar and range envelopes
pub mod filter;

/// Cluster groups, shard clients, dispatch and merge policies
pub mod cluster;

/// Deduplicating query cache
pub mod cache;

/// Transport-facing entry points and request bodies
pub mod service;

/// Command-line query helpers
pub mod shell;

/// Series generators for seeding local shards
pub mod generator;

/// Configuration management with TOML support
pub mod config;

/// Prometheus metrics and telemetry
pub mod metrics;

// Re-export main types
pub use cluster::{AggregateOutcome, ClusterDispatch, ClusterManager, DispatchOptions};
pub use error::{Error, Result};
pub use filter::{FilterExpression, RangeFilter};
pub use service::MetadataService;
pub use types::{Series, TimeRange, Timestamp};
