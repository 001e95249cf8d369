// Bucketed latency distribution backing the adaptive deadline controller.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::MAX_ACK_DEADLINE_SECONDS;

/// Fixed-width histogram of per-message handling latency in whole seconds.
///
/// 601 one-second buckets over `[0, 600]`; values past the last bucket are
/// clamped into it. Recording is lock-free; the percentile scan may observe a
/// snapshot that is slightly stale relative to concurrent recorders.
pub struct LatencyDistribution {
    buckets: Vec<AtomicU64>,
}

impl LatencyDistribution {
    pub fn new() -> Self {
        let buckets = (0..=MAX_ACK_DEADLINE_SECONDS)
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { buckets }
    }

    pub fn record(&self, seconds: u64) {
        let index = seconds.min(MAX_ACK_DEADLINE_SECONDS) as usize;
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Smallest value `v` such that at least `percentile`% of recorded samples
    /// are `<= v`. Returns 0 when nothing has been recorded.
    pub fn percentile(&self, percentile: f64) -> u64 {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }
        let threshold = (total as f64 * percentile / 100.0).ceil() as u64;
        let mut cumulative = 0u64;
        for (index, count) in counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= threshold {
                return index as u64;
            }
        }
        MAX_ACK_DEADLINE_SECONDS
    }
}

impl Default for LatencyDistribution {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_distribution_reports_zero() {
        let distribution = LatencyDistribution::new();
        assert_eq!(distribution.percentile(99.9), 0);
    }

    #[test]
    fn percentile_satisfies_the_cumulative_law() {
        let distribution = LatencyDistribution::new();
        for seconds in 1..=100u64 {
            distribution.record(seconds);
        }
        // percentile(p) must return v with #{x <= v} >= p% of N.
        assert_eq!(distribution.percentile(50.0), 50);
        assert_eq!(distribution.percentile(99.9), 100);
        assert_eq!(distribution.percentile(1.0), 1);
    }

    #[test]
    fn oversized_samples_clamp_into_the_last_bucket() {
        let distribution = LatencyDistribution::new();
        distribution.record(10_000);
        assert_eq!(distribution.percentile(99.9), MAX_ACK_DEADLINE_SECONDS);
    }

    #[test]
    fn uniform_spread_lands_near_the_high_end() {
        let distribution = LatencyDistribution::new();
        for i in 0..1_000u64 {
            distribution.record(5 + i % 16);
        }
        let p = distribution.percentile(99.9);
        assert!((19..=20).contains(&p), "p99.9 was {p}");
    }
}
