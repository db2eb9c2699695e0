use super::SeriesGenerator;
use crate::types::Series;

/// One `sine` series per period
///
/// The n-th series is tagged with a period of `base_period_ms * (n + 1)`,
/// along with the wave's magnitude.
#[derive(Debug, Clone)]
pub struct SineGenerator {
    base_period_ms: u64,
    magnitude: u64,
}

impl Default for SineGenerator {
    fn default() -> Self {
        Self {
            base_period_ms: 60_000,
            magnitude: 100,
        }
    }
}

impl SineGenerator {
    /// Generator with the given shortest period and magnitude
    pub fn new(base_period_ms: u64, magnitude: u64) -> Self {
        Self {
            base_period_ms,
            magnitude,
        }
    }
}

impl SeriesGenerator for SineGenerator {
    fn name(&self) -> &str {
        "sine"
    }

    fn generate(&self, count: usize) -> Vec<Series> {
        (1..=count as u64)
            .map(|n| {
                Series::new("sine")
                    .with_tag("period", self.base_period_ms.saturating_mul(n).to_string())
                    .with_tag("magnitude", self.magnitude.to_string())
            })
            .collect()
    }
}
