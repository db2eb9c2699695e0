use super::SeriesGenerator;
use crate::types::Series;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

const KEYS: [&str; 6] = ["cpu", "memory", "disk", "network", "latency", "requests"];

/// Duplicate draws in a row before the vocabulary counts as exhausted
const MAX_CONSECUTIVE_MISSES: usize = 1_000;

const TAGS: [(&str, &[&str]); 5] = [
    ("host", &["web-1", "web-2", "web-3", "db-1", "db-2", "cache-1"]),
    ("region", &["eu-west", "us-east", "us-west", "ap-south"]),
    ("role", &["frontend", "backend", "storage"]),
    ("env", &["prod", "staging"]),
    ("service", &["api", "auth", "billing", "search"]),
];

/// Random key and tag combinations from a fixed vocabulary
///
/// Every series carries `host` plus any of four other tags, so the number
/// of distinct identities is bounded. `generate` returns fewer series than
/// requested once the vocabulary is exhausted.
#[derive(Debug, Clone)]
pub struct RandomGenerator {
    seed: u64,
}

impl RandomGenerator {
    /// Generator producing the same sequence for the same seed
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn pick<'a>(rng: &mut StdRng, values: &[&'a str]) -> &'a str {
        values[rng.random_range(0..values.len())]
    }
}

impl SeriesGenerator for RandomGenerator {
    fn name(&self) -> &str {
        "random"
    }

    fn generate(&self, count: usize) -> Vec<Series> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(count.min(1024));

        let mut misses = 0;
        while out.len() < count && misses < MAX_CONSECUTIVE_MISSES {
            let (host_key, hosts) = TAGS[0];
            let mut series =
                Series::new(Self::pick(&mut rng, &KEYS)).with_tag(host_key, Self::pick(&mut rng, hosts));

            for (key, values) in &TAGS[1..] {
                if rng.random_bool(0.6) {
                    series = series.with_tag(*key, Self::pick(&mut rng, values));
                }
            }

            if seen.insert(series.clone()) {
                out.push(series);
                misses = 0;
            } else {
                misses += 1;
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_output_is_stable() {
        let a = RandomGenerator::new(7).generate(50);
        let b = RandomGenerator::new(7).generate(50);
        assert_eq!(a, b);
        assert_eq!(a.len(), 50);
    }

    #[test]
    fn test_series_are_distinct_and_tagged() {
        let series = RandomGenerator::new(1).generate(200);
        let distinct: BTreeSet<_> = series.iter().collect();
        assert_eq!(distinct.len(), series.len());
        assert!(series.iter().all(|s| s.tag("host").is_some()));
        assert!(series.iter().all(|s| KEYS.contains(&s.key.as_str())));
    }

    #[test]
    fn test_exhausted_vocabulary_stops() {
        let series = RandomGenerator::new(3).generate(1_000_000);
        assert!(series.len() < 1_000_000);
        assert!(!series.is_empty());
    }
}
