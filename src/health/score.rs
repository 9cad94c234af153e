//! Pure scoring functions over raw health counters.

use serde::{Deserialize, Serialize};

/// Weight of the newest latency sample in the moving average.
pub const EWMA_ALPHA: f64 = 0.2;
/// Latency at which the penalty would reach 1.0 if it were not capped.
pub const LATENCY_PENALTY_SCALE_MS: f64 = 10_000.0;
/// Latency can never remove more than half of the score.
pub const MAX_LATENCY_PENALTY: f64 = 0.5;

/// Successes over total attempts; 1.0 when nothing has been attempted yet.
pub fn success_rate(success_count: u64, failure_count: u64) -> f64 {
    let total = success_count.saturating_add(failure_count);
    if total == 0 {
        return 1.0;
    }
    success_count as f64 / total as f64
}

/// `min(ewma / 10s, 0.5)`; negative or non-finite inputs carry no penalty.
pub fn latency_penalty(latency_ewma_ms: f64) -> f64 {
    if !latency_ewma_ms.is_finite() || latency_ewma_ms <= 0.0 {
        return 0.0;
    }
    (latency_ewma_ms / LATENCY_PENALTY_SCALE_MS).min(MAX_LATENCY_PENALTY)
}

/// `success_rate * (1 - latency_penalty)`, clamped to `[0, 1]`.
pub fn health_score(success_count: u64, failure_count: u64, latency_ewma_ms: f64) -> f64 {
    if success_count == 0 && failure_count == 0 {
        return 1.0;
    }
    let score = success_rate(success_count, failure_count) * (1.0 - latency_penalty(latency_ewma_ms));
    score.clamp(0.0, 1.0)
}

/// `α·new + (1-α)·prev` with `α = 0.2`.
pub fn update_latency_ewma(prev_ewma_ms: f64, new_latency_ms: f64) -> f64 {
    EWMA_ALPHA * new_latency_ms + (1.0 - EWMA_ALPHA) * prev_ewma_ms
}

/// Discrete presentation tier for a score. Hints only, never a hard gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTier {
    Unavailable,
    Poor,
    Degraded,
    Good,
    Excellent,
}

impl StatusTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            StatusTier::Excellent
        } else if score >= 0.7 {
            StatusTier::Good
        } else if score >= 0.5 {
            StatusTier::Degraded
        } else if score >= 0.3 {
            StatusTier::Poor
        } else {
            StatusTier::Unavailable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusTier::Excellent => "excellent",
            StatusTier::Good => "good",
            StatusTier::Degraded => "degraded",
            StatusTier::Poor => "poor",
            StatusTier::Unavailable => "unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_provider_is_optimistic() {
        assert_eq!(health_score(0, 0, 0.0), 1.0);
        assert_eq!(health_score(0, 0, 9_999.0), 1.0);
        assert_eq!(StatusTier::from_score(health_score(0, 0, 0.0)), StatusTier::Excellent);
    }

    #[test]
    fn test_score_bounds_over_grid() {
        let latencies = [0.0, 1.0, 250.0, 4_999.0, 5_000.0, 60_000.0, f64::MAX];
        for s in [0u64, 1, 7, 100, u64::MAX / 2] {
            for f in [0u64, 1, 3, 100, u64::MAX / 2] {
                for &l in &latencies {
                    let score = health_score(s, f, l);
                    assert!((0.0..=1.0).contains(&score), "s={} f={} l={} -> {}", s, f, l, score);
                }
            }
        }
    }

    #[test]
    fn test_latency_penalty_is_capped() {
        assert_eq!(latency_penalty(0.0), 0.0);
        assert!((latency_penalty(2_000.0) - 0.2).abs() < 1e-12);
        assert_eq!(latency_penalty(5_000.0), 0.5);
        assert_eq!(latency_penalty(120_000.0), 0.5);
        assert_eq!(latency_penalty(-10.0), 0.0);
        assert_eq!(latency_penalty(f64::NAN), 0.0);
    }

    #[test]
    fn test_slow_reliable_beats_fast_unreliable() {
        let slow_reliable = health_score(100, 0, 30_000.0);
        let fast_flaky = health_score(40, 60, 50.0);
        assert!(slow_reliable > fast_flaky);
        assert_eq!(slow_reliable, 0.5);
    }

    #[test]
    fn test_ewma_converges_to_repeated_sample() {
        let mut ewma = 5_000.0;
        for _ in 0..200 {
            ewma = update_latency_ewma(ewma, 300.0);
        }
        assert!((ewma - 300.0).abs() < 1e-6);
        assert_eq!(update_latency_ewma(300.0, 300.0), 300.0);
    }

    #[test]
    fn test_ewma_weights_recent_sample() {
        assert!((update_latency_ewma(1_000.0, 2_000.0) - 1_200.0).abs() < 1e-9);
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(StatusTier::from_score(0.9), StatusTier::Excellent);
        assert_eq!(StatusTier::from_score(0.89), StatusTier::Good);
        assert_eq!(StatusTier::from_score(0.7), StatusTier::Good);
        assert_eq!(StatusTier::from_score(0.5), StatusTier::Degraded);
        assert_eq!(StatusTier::from_score(0.3), StatusTier::Poor);
        assert_eq!(StatusTier::from_score(0.29), StatusTier::Unavailable);
    }
}
