//! Per-provider circuit state derived from health counters and cooldown timers.

use crate::health::ProviderHealth;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stored circuit state of a provider.
///
/// A stored `Open` whose cooldown has expired is observed as `HalfOpen`
/// (see [`observed_state`]): eligible for one more probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

/// Thresholds for tripping a provider's circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitPolicy {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// A score below this also opens the circuit, once `min_samples` attempts exist.
    pub min_health_score: f64,
    pub min_samples: u64,
    pub cooldown: Duration,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            min_health_score: 0.3,
            min_samples: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitPolicy {
    /// Create a new policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridable via env:
    /// - `ROUTER_BREAKER_FAILURE_THRESHOLD` (default 3)
    /// - `ROUTER_BREAKER_COOLDOWN_SECS` (default 60)
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Some(threshold) = std::env::var("ROUTER_BREAKER_FAILURE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            policy.failure_threshold = threshold.max(1);
        }
        if let Some(secs) = std::env::var("ROUTER_BREAKER_COOLDOWN_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            policy.cooldown = Duration::from_secs(secs);
        }
        policy
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the low-score trip threshold and the sample count it needs
    pub fn with_min_health_score(mut self, score: f64, min_samples: u64) -> Self {
        self.min_health_score = score.clamp(0.0, 1.0);
        self.min_samples = min_samples;
        self
    }

    /// Set the cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn cooldown_ms(&self) -> u64 {
        u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX)
    }

    fn should_trip(&self, health: &ProviderHealth) -> bool {
        if health.consecutive_failures >= self.failure_threshold {
            return true;
        }
        health.total_attempts() >= self.min_samples && health.health_score < self.min_health_score
    }

    fn trip(&self, health: &mut ProviderHealth, now_ms: u64) {
        health.circuit_state = CircuitState::Open;
        health.cooldown_until_ms = now_ms.saturating_add(self.cooldown_ms());
    }

    /// Circuit transition after a success. Counters and score are already updated.
    /// Circuit transition after a success. Returns true if this success closed the circuit.
    pub fn on_success(&self, health: &mut ProviderHealth, now_ms: u64) -> bool {
        health.consecutive_failures = 0;
        if observed_state(health, now_ms) == CircuitState::HalfOpen {
            health.circuit_state = CircuitState::Closed;
            return true;
        }
        false
    }

    /// Circuit transition after a failure. Returns true if this failure opened the circuit.
    pub fn on_failure(&self, health: &mut ProviderHealth, now_ms: u64) -> bool {
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        match observed_state(health, now_ms) {
            // the probe failed: straight back into cooldown
            CircuitState::HalfOpen => {
                self.trip(health, now_ms);
                true
            }
            CircuitState::Open => false,
            CircuitState::Closed => {
                if self.should_trip(health) {
                    self.trip(health, now_ms);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn snapshot(&self, health: &ProviderHealth, now_ms: u64) -> CircuitSnapshot {
        let state = observed_state(health, now_ms);
        let open_remaining_ms = if health.cooldown_until_ms > now_ms {
            Some(health.cooldown_until_ms - now_ms)
        } else {
            None
        };
        CircuitSnapshot {
            state,
            failure_threshold: self.failure_threshold,
            cooldown_ms: self.cooldown_ms(),
            consecutive_failures: health.consecutive_failures,
            open_remaining_ms,
        }
    }
}

/// The state selection should act on at `now_ms`.
pub fn observed_state(health: &ProviderHealth, now_ms: u64) -> CircuitState {
    match health.circuit_state {
        CircuitState::Open if now_ms >= health.cooldown_until_ms => CircuitState::HalfOpen,
        state => state,
    }
}

/// Eligibility predicate: not open and not cooling down.
pub fn is_available(health: &ProviderHealth, now_ms: u64) -> bool {
    observed_state(health, now_ms) != CircuitState::Open && now_ms >= health.cooldown_until_ms
}
