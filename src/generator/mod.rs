//! Series generators for seeding local shards
//!
//! Generators are looked up by name in a [`GeneratorRegistry`]. The registry
//! is an explicit map from name to factory function, filled at startup:
//!
//! - `random`: seeded random combinations of keys and tags
//! - `sine`: one `sine` series per period
//!
//! # Example
//!
//! ```rust
//! use kuba_metadata::config::GeneratorConfig;
//! use kuba_metadata::generator::GeneratorRegistry;
//!
//! let registry = GeneratorRegistry::with_defaults();
//! let generator = registry.build("random", &GeneratorConfig::default()).unwrap();
//!
//! let series = generator.generate(10);
//! assert_eq!(series.len(), 10);
//! assert_eq!(series, generator.generate(10));
//! ```

mod random;
mod sine;

pub use random::RandomGenerator;
pub use sine::SineGenerator;

use crate::config::GeneratorConfig;
use crate::error::{Error, Result};
use crate::types::Series;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Produces series identities
pub trait SeriesGenerator: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Up to `count` distinct series, identical for identical settings
    fn generate(&self, count: usize) -> Vec<Series>;
}

/// Builds a generator from configuration
pub type GeneratorFactory = fn(&GeneratorConfig) -> Arc<dyn SeriesGenerator>;

/// Name to factory lookup
#[derive(Debug, Clone, Default)]
pub struct GeneratorRegistry {
    factories: BTreeMap<String, GeneratorFactory>,
}

impl GeneratorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `random` and `sine`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("random", build_random);
        registry.register("sine", build_sine);
        registry
    }

    /// Register a factory, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, factory: GeneratorFactory) {
        let name = name.into();
        debug!(generator = %name, "Registered series generator");
        self.factories.insert(name, factory);
    }

    /// Build the generator registered as `name`
    pub fn build(&self, name: &str, config: &GeneratorConfig) -> Result<Arc<dyn SeriesGenerator>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::Configuration(format!(
                "Unknown generator {:?} (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        Ok(factory(config))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

fn build_random(config: &GeneratorConfig) -> Arc<dyn SeriesGenerator> {
    Arc::new(RandomGenerator::new(config.seed))
}

fn build_sine(_: &GeneratorConfig) -> Arc<dyn SeriesGenerator> {
    Arc::new(SineGenerator::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_registered() {
        let registry = GeneratorRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["random", "sine"]);

        let config = GeneratorConfig::default();
        assert_eq!(registry.build("sine", &config).unwrap().name(), "sine");
        assert_eq!(registry.build("random", &config).unwrap().name(), "random");
    }

    #[test]
    fn test_unknown_generator() {
        let registry = GeneratorRegistry::with_defaults();
        let err = registry
            .build("gaussian", &GeneratorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("random, sine"));
    }

    #[test]
    fn test_custom_factory() {
        struct Fixed;

        impl SeriesGenerator for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }

            fn generate(&self, count: usize) -> Vec<Series> {
                (0..count).map(|i| Series::new(format!("fixed{}", i))).collect()
            }
        }

        fn build_fixed(_: &GeneratorConfig) -> Arc<dyn SeriesGenerator> {
            Arc::new(Fixed)
        }

        let mut registry = GeneratorRegistry::new();
        registry.register("fixed", build_fixed);
        let generator = registry.build("fixed", &GeneratorConfig::default()).unwrap();
        assert_eq!(generator.generate(2)[1].key, "fixed1");
    }
}
