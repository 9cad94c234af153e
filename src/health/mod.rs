//! 健康评分模块：记录每个提供商的调用结果并计算健康分。
//!
//! Provider health scoring.
//!
//! Each provider carries a rolling record of outcomes: counters, a latency
//! moving average, a derived score in `[0, 1]` and its circuit state.
//!
//! | Item | Role |
//! |------|------|
//! | [`ProviderHealth`] | Per-provider record, optimistic by default |
//! | [`HealthUpdate`] | One attempt outcome, applied atomically by the store |
//! | [`HealthTracker`] | The only mutation path (`record_outcome`) |
//! | [`HealthStore`] | Pluggable persistence, see [`InMemoryHealthStore`] |
//! | [`score`] | Pure scoring functions |

pub mod score;
pub mod store;

pub use score::{health_score, StatusTier};
pub use store::{HealthStore, InMemoryHealthStore};

use crate::normalize::ErrorKind;
use crate::resilience::circuit_breaker::{self, CircuitPolicy, CircuitSnapshot, CircuitState};
use crate::utils::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    /// Exponentially weighted latency in ms. Meaningful once `latency_samples > 0`.
    pub latency_ewma_ms: f64,
    pub latency_samples: u64,
    pub health_score: f64,
    pub circuit_state: CircuitState,
    /// Epoch ms before which the provider is not selectable. 0 when unset.
    pub cooldown_until_ms: u64,
    pub last_error_type: Option<ErrorKind>,
    pub updated_at_ms: u64,
}

impl ProviderHealth {
    /// Record for a provider with no history.
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            latency_ewma_ms: 0.0,
            latency_samples: 0,
            health_score: 1.0,
            circuit_state: CircuitState::Closed,
            cooldown_until_ms: 0,
            last_error_type: None,
            updated_at_ms: 0,
        }
    }

    pub fn total_attempts(&self) -> u64 {
        self.success_count.saturating_add(self.failure_count)
    }

    pub fn status_tier(&self) -> StatusTier {
        StatusTier::from_score(self.health_score)
    }

    pub fn is_available(&self, now_ms: u64) -> bool {
        circuit_breaker::is_available(self, now_ms)
    }

    pub fn observed_state(&self, now_ms: u64) -> CircuitState {
        circuit_breaker::observed_state(self, now_ms)
    }

    /// Fold one outcome into the record and report the circuit transition it caused.
    ///
    /// Counters and latency are updated first so the circuit sees the new score.
    pub fn apply(&mut self, update: &HealthUpdate) -> CircuitChange {
        if update.succeeded {
            self.success_count = self.success_count.saturating_add(1);
        } else {
            self.failure_count = self.failure_count.saturating_add(1);
            if let Some(kind) = update.error_kind {
                self.last_error_type = Some(kind);
            }
        }

        if let Some(latency) = update.latency_ms {
            let sample = latency as f64;
            self.latency_ewma_ms = if self.latency_samples == 0 {
                sample
            } else {
                score::update_latency_ewma(self.latency_ewma_ms, sample)
            };
            self.latency_samples = self.latency_samples.saturating_add(1);
        }

        self.health_score =
            score::health_score(self.success_count, self.failure_count, self.latency_ewma_ms);
        self.updated_at_ms = update.at_ms;

        let changed = if update.succeeded {
            update.policy.on_success(self, update.at_ms)
        } else {
            update.policy.on_failure(self, update.at_ms)
        };
        match (changed, update.succeeded) {
            (false, _) => CircuitChange::Unchanged,
            (true, true) => CircuitChange::Closed,
            (true, false) => CircuitChange::Opened,
        }
    }
}

/// Circuit transition caused by one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitChange {
    Unchanged,
    Opened,
    Closed,
}

/// A single attempt outcome plus the policy it is judged by.
#[derive(Debug, Clone)]
pub struct HealthUpdate {
    pub succeeded: bool,
    pub latency_ms: Option<u64>,
    pub error_kind: Option<ErrorKind>,
    pub at_ms: u64,
    pub policy: CircuitPolicy,
}

impl HealthUpdate {
    pub fn success(latency_ms: Option<u64>, policy: CircuitPolicy) -> Self {
        Self {
            succeeded: true,
            latency_ms,
            error_kind: None,
            at_ms: now_ms(),
            policy,
        }
    }

    pub fn failure(error_kind: ErrorKind, latency_ms: Option<u64>, policy: CircuitPolicy) -> Self {
        Self {
            succeeded: false,
            latency_ms,
            error_kind: Some(error_kind),
            at_ms: now_ms(),
            policy,
        }
    }

    pub fn at(mut self, at_ms: u64) -> Self {
        self.at_ms = at_ms;
        self
    }
}

/// Per-provider health report entry.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub provider_id: String,
    pub health_score: f64,
    pub tier: StatusTier,
    pub available: bool,
    pub circuit: CircuitSnapshot,
    pub success_count: u64,
    pub failure_count: u64,
    pub latency_ewma_ms: Option<f64>,
    pub last_error_type: Option<ErrorKind>,
}

/// Records attempt outcomes against a [`HealthStore`].
#[derive(Clone)]
pub struct HealthTracker {
    store: Arc<dyn HealthStore>,
    policy: CircuitPolicy,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn HealthStore>, policy: CircuitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn in_memory(policy: CircuitPolicy) -> Self {
        Self::new(Arc::new(InMemoryHealthStore::new()), policy)
    }

    pub fn policy(&self) -> &CircuitPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn HealthStore> {
        &self.store
    }

    /// Fold one attempt outcome into the provider's record.
    ///
    /// Applied atomically per provider by the store; concurrent outcomes never lose updates.
    pub async fn record_outcome(
        &self,
        provider_id: &str,
        succeeded: bool,
        latency_ms: Option<u64>,
        error_kind: Option<ErrorKind>,
    ) -> crate::Result<ProviderHealth> {
        let update = if succeeded {
            HealthUpdate::success(latency_ms, self.policy.clone())
        } else {
            HealthUpdate::failure(
                error_kind.unwrap_or(ErrorKind::Unknown),
                latency_ms,
                self.policy.clone(),
            )
        };
        let (health, change) = self.store.update_health(provider_id, update).await?;

        match change {
            CircuitChange::Opened => warn!(
                provider_id,
                consecutive_failures = health.consecutive_failures,
                health_score = health.health_score,
                cooldown_until_ms = health.cooldown_until_ms,
                "Circuit open"
            ),
            CircuitChange::Closed => debug!(provider_id, "Circuit closed after half-open success"),
            CircuitChange::Unchanged => {}
        }
        Ok(health)
    }

    /// Current record, or the optimistic default for unknown providers.
    pub async fn health_of(&self, provider_id: &str) -> crate::Result<ProviderHealth> {
        Ok(self
            .store
            .get_health(provider_id)
            .await?
            .unwrap_or_else(|| ProviderHealth::new(provider_id)))
    }

    /// Records for the given providers, defaulted where missing.
    pub async fn snapshot(
        &self,
        provider_ids: &[String],
    ) -> crate::Result<HashMap<String, ProviderHealth>> {
        let mut known: HashMap<String, ProviderHealth> = self
            .store
            .get_all_health()
            .await?
            .into_iter()
            .map(|h| (h.provider_id.clone(), h))
            .collect();
        Ok(provider_ids
            .iter()
            .map(|id| {
                let health = known
                    .remove(id)
                    .unwrap_or_else(|| ProviderHealth::new(id.clone()));
                (id.clone(), health)
            })
            .collect())
    }

    pub async fn report(&self, provider_ids: &[String]) -> crate::Result<Vec<HealthReport>> {
        let now = now_ms();
        let mut snapshot = self.snapshot(provider_ids).await?;
        Ok(provider_ids
            .iter()
            .filter_map(|id| snapshot.remove(id))
            .map(|h| HealthReport {
                provider_id: h.provider_id.clone(),
                health_score: h.health_score,
                tier: h.status_tier(),
                available: h.is_available(now),
                circuit: self.policy.snapshot(&h, now),
                success_count: h.success_count,
                failure_count: h.failure_count,
                latency_ewma_ms: (h.latency_samples > 0).then_some(h.latency_ewma_ms),
                last_error_type: h.last_error_type,
            })
            .collect())
    }

    pub async fn reset(&self, provider_id: &str) -> crate::Result<()> {
        self.store.reset_health(provider_id).await
    }
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("store", &self.store.name())
            .field("policy", &self.policy)
            .finish()
    }
}
