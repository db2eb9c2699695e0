//! Configuration management for the metadata service
//!
//! TOML configuration files with environment variable overrides and
//! defaults for every field.
//!
//! # Example
//!
//! ```toml
//! [cluster]
//! default_group = "default"
//! shards = 4
//! deadline_ms = 5000
//!
//! [cache]
//! ttl_secs = 30
//! ```

use crate::cache::CacheConfig;
use crate::cluster::DispatchOptions;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Cluster and dispatch settings
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Query cache settings
    #[serde(default)]
    pub cache: CacheSection,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Series generator used to seed local shards
    #[serde(default)]
    pub generator: GeneratorConfig,
}

/// Cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Group used when a request names none
    #[serde(default = "default_group")]
    pub default_group: String,

    /// Number of shards in a locally built group
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Dispatch deadline in milliseconds
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Accept partial read results by default
    #[serde(default)]
    pub partial_tolerance: bool,
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheSection {
    /// Enable the query cache
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum completed entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Entry lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

/// Monitoring configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level (error, warn, info, debug, trace) or an EnvFilter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Generator configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GeneratorConfig {
    /// Registered generator name
    #[serde(default = "default_generator")]
    pub name: String,

    /// Number of series to generate
    #[serde(default = "default_series")]
    pub series: usize,

    /// Seed for reproducible output
    #[serde(default = "default_seed")]
    pub seed: u64,
}

// Default value functions
fn default_group() -> String { "default".to_string() }
fn default_shards() -> usize { 4 }
fn default_deadline_ms() -> u64 { 10_000 }
fn default_max_entries() -> usize { 10_000 }
fn default_ttl_secs() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }
fn default_generator() -> String { "random".to_string() }
fn default_series() -> usize { 1_000 }
fn default_seed() -> u64 { 42 }
fn default_true() -> bool { true }

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            default_group: default_group(),
            shards: default_shards(),
            deadline_ms: default_deadline_ms(),
            partial_tolerance: false,
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_enabled: true,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            name: default_generator(),
            series: default_series(),
            seed: default_seed(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_env_overrides(&mut self) {
        // Cluster
        if let Ok(group) = std::env::var("METADATA_DEFAULT_GROUP") {
            self.cluster.default_group = group;
        }
        if let Ok(deadline) = std::env::var("METADATA_DEADLINE_MS") {
            if let Ok(ms) = deadline.parse() {
                self.cluster.deadline_ms = ms;
            }
        }

        // Cache
        if let Ok(ttl) = std::env::var("METADATA_CACHE_TTL_SECS") {
            if let Ok(secs) = ttl.parse() {
                self.cache.ttl_secs = secs;
            }
        }
        if let Ok(entries) = std::env::var("METADATA_CACHE_MAX_ENTRIES") {
            if let Ok(n) = entries.parse() {
                self.cache.max_entries = n;
            }
        }

        // Monitoring
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.monitoring.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cluster.default_group.is_empty() {
            return Err(Error::Configuration(
                "Default group name cannot be empty".to_string(),
            ));
        }
        if self.cluster.shards == 0 {
            return Err(Error::Configuration("Shard count must be > 0".to_string()));
        }
        if self.cluster.deadline_ms == 0 {
            return Err(Error::Configuration("Deadline must be > 0".to_string()));
        }

        if self.cache.enabled {
            if self.cache.max_entries == 0 {
                return Err(Error::Configuration(
                    "Cache max entries must be > 0".to_string(),
                ));
            }
            if self.cache.ttl_secs == 0 {
                return Err(Error::Configuration("Cache TTL must be > 0".to_string()));
            }
        }

        if self.generator.name.is_empty() {
            return Err(Error::Configuration(
                "Generator name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!("Failed to write config file {}: {}", path, e))
        })
    }

    /// Dispatch options derived from the cluster section
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions::default()
            .with_deadline(Duration::from_millis(self.cluster.deadline_ms))
            .with_partial_tolerance(self.cluster.partial_tolerance)
    }

    /// Cache settings derived from the cache section
    pub fn cache_config(&self) -> CacheConfig {
        let config = CacheConfig::default()
            .with_max_entries(self.cache.max_entries)
            .with_ttl(Duration::from_secs(self.cache.ttl_secs));

        if self.cache.enabled {
            config
        } else {
            config.disabled()
        }
    }
}
