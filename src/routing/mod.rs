//! 候选选择模块：按健康分与优先级对可用提供商排序，生成回退链。
//!
//! Candidate selection.
//!
//! This module is **pure logic**: it performs no I/O. The router gathers one
//! [`Candidate`] per configured provider (credential presence plus current health)
//! and asks the [`CandidateSelector`] for an ordered fallback chain.
//!
//! Ordering, first key wins:
//! 1. effective score, descending (health score minus the recency penalty)
//! 2. configured priority, descending
//! 3. provider id, ascending
//!
//! Providers with an open circuit, an active cooldown or no credential are excluded.

use crate::health::ProviderHealth;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One configured provider as seen at selection time.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: String,
    pub priority: i32,
    pub has_credential: bool,
    pub health: ProviderHealth,
}

impl Candidate {
    pub fn new(provider_id: impl Into<String>, health: ProviderHealth) -> Self {
        Self {
            provider_id: provider_id.into(),
            priority: 0,
            has_credential: true,
            health,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_credential(mut self, has_credential: bool) -> Self {
        self.has_credential = has_credential;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Subtracted from the ranking score of the provider that served the previous reply.
    pub recency_penalty: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            recency_penalty: 0.1,
        }
    }
}

/// Why a candidate was left out of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    MissingCredential,
    CircuitOpen,
}

/// A candidate with its ranking inputs, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RankedCandidate {
    pub provider_id: String,
    pub priority: i32,
    pub health_score: f64,
    pub effective_score: f64,
    pub recently_used: bool,
    pub excluded: Option<Exclusion>,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSelector {
    config: SelectionConfig,
}

impl CandidateSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Ordered provider ids to try. Empty when nothing is eligible.
    pub fn select_chain(
        &self,
        candidates: &[Candidate],
        recently_used: Option<&str>,
        now_ms: u64,
    ) -> Vec<String> {
        self.rank(candidates, recently_used, now_ms)
            .into_iter()
            .filter(|c| c.excluded.is_none())
            .map(|c| c.provider_id)
            .collect()
    }

    /// Every candidate in chain order, excluded ones last with the reason attached.
    pub fn rank(
        &self,
        candidates: &[Candidate],
        recently_used: Option<&str>,
        now_ms: u64,
    ) -> Vec<RankedCandidate> {
        let mut ranked: Vec<RankedCandidate> = candidates
            .iter()
            .map(|c| {
                let recent = recently_used == Some(c.provider_id.as_str());
                let excluded = if !c.has_credential {
                    Some(Exclusion::MissingCredential)
                } else if !c.health.is_available(now_ms) {
                    Some(Exclusion::CircuitOpen)
                } else {
                    None
                };
                RankedCandidate {
                    provider_id: c.provider_id.clone(),
                    priority: c.priority,
                    health_score: c.health.health_score,
                    effective_score: self.effective_score(c.health.health_score, recent),
                    recently_used: recent,
                    excluded,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            a.excluded
                .is_some()
                .cmp(&b.excluded.is_some())
                .then_with(|| {
                    b.effective_score
                        .partial_cmp(&a.effective_score)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });
        ranked
    }

    fn effective_score(&self, health_score: f64, recently_used: bool) -> f64 {
        if recently_used {
            health_score - self.config.recency_penalty
        } else {
            health_score
        }
    }
}
