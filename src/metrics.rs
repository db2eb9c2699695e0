//! Prometheus metrics for cluster dispatch and the query cache
//!
//! All metrics live in the default registry. Labels are bounded: `operation`
//! is an [`OperationKind`](crate::cluster::OperationKind) name, `outcome` is
//! one of `succeeded`/`partial`/`failed` and `result` is one of
//! `hit`/`miss`/`attached`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // === Dispatch ===

    /// Aggregated dispatches by outcome
    pub static ref DISPATCH_TOTAL: CounterVec = register_counter_vec!(
        "metadata_dispatch_total",
        "Aggregated cluster dispatches",
        &["operation", "outcome"]
    ).unwrap();

    /// Individual shard failures
    pub static ref SHARD_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "metadata_shard_failures_total",
        "Shard calls that failed",
        &["operation"]
    ).unwrap();

    /// Time from fan-out to aggregate
    pub static ref DISPATCH_DURATION: HistogramVec = register_histogram_vec!(
        "metadata_dispatch_duration_seconds",
        "Cluster dispatch latency in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // === Cache ===

    /// Cache lookups by result
    pub static ref CACHE_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "metadata_cache_requests_total",
        "Metadata cache lookups",
        &["operation", "result"]
    ).unwrap();

    /// Completed entries currently cached
    pub static ref CACHE_ENTRIES: Gauge = register_gauge!(
        "metadata_cache_entries",
        "Completed entries held by the metadata cache"
    ).unwrap();
}

/// Get metrics in Prometheus text format
///
/// # Returns
///
/// Result containing the formatted metrics string, or an error if encoding fails
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a settled dispatch
#[inline]
pub fn record_dispatch(operation: &str, outcome: &str, duration_secs: f64) {
    DISPATCH_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();

    DISPATCH_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record a failed shard call
#[inline]
pub fn record_shard_failure(operation: &str) {
    SHARD_FAILURES_TOTAL.with_label_values(&[operation]).inc();
}

/// Record a cache lookup
#[inline]
pub fn record_cache_request(operation: &str, result: &str) {
    CACHE_REQUESTS_TOTAL
        .with_label_values(&[operation, result])
        .inc();
}

/// Update the cached entry count
#[inline]
pub fn update_cache_entries(count: usize) {
    CACHE_ENTRIES.set(count as f64);
}
