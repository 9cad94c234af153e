//! Router configuration.
//!
//! Loaded from YAML, then adjusted from the environment, then validated:
//!
//! ```yaml
//! providers:
//!   - id: openai
//!     kind: openai
//!     base_url: https://api.openai.com/v1
//!     model: gpt-4o-mini
//!     priority: 10
//!   - id: anthropic
//!     kind: anthropic
//!     base_url: https://api.anthropic.com/v1
//!     model: claude-3-5-haiku-latest
//! circuit:
//!   failure_threshold: 3
//!   cooldown_secs: 60
//! selection:
//!   recency_penalty: 0.1
//! attempt_timeout_ms: 60000
//! ```

use crate::resilience::CircuitPolicy;
use crate::routing::SelectionConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Wire format an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(alias = "openai_compatible")]
    Openai,
    Anthropic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Default model for requests that do not name one.
    pub model: String,
    #[serde(default)]
    pub models: Vec<String>,
    /// Static tie-break weight, higher first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_context_tokens: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub min_health_score: f64,
    pub min_samples: u64,
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        let policy = CircuitPolicy::default();
        Self {
            failure_threshold: policy.failure_threshold,
            min_health_score: policy.min_health_score,
            min_samples: policy.min_samples,
            cooldown_secs: policy.cooldown.as_secs(),
        }
    }
}

impl CircuitConfig {
    pub fn to_policy(&self) -> CircuitPolicy {
        CircuitPolicy::new()
            .with_failure_threshold(self.failure_threshold)
            .with_min_health_score(self.min_health_score, self.min_samples)
            .with_cooldown(Duration::from_secs(self.cooldown_secs))
    }
}

fn default_attempt_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Idle timeout between chunks of one attempt. 0 disables it.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl RouterConfig {
    /// Parse YAML without touching the environment.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("router_config"),
            )
        })?;
        Self::from_yaml_str(&text)
    }

    /// Read, apply env overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_path(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Env overrides:
    /// - `ROUTER_BREAKER_FAILURE_THRESHOLD`
    /// - `ROUTER_BREAKER_COOLDOWN_SECS`
    /// - `ROUTER_RECENCY_PENALTY`
    /// - `ROUTER_ATTEMPT_TIMEOUT_MS`
    ///
    /// Unparsable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u32>("ROUTER_BREAKER_FAILURE_THRESHOLD") {
            self.circuit.failure_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("ROUTER_BREAKER_COOLDOWN_SECS") {
            self.circuit.cooldown_secs = v;
        }
        if let Some(v) = env_parse::<f64>("ROUTER_RECENCY_PENALTY") {
            self.selection.recency_penalty = v;
        }
        if let Some(v) = env_parse::<u64>("ROUTER_ATTEMPT_TIMEOUT_MS") {
            self.attempt_timeout_ms = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(invalid("at least one provider is required", "providers"));
        }
        let mut seen = HashSet::new();
        for (i, p) in self.providers.iter().enumerate() {
            if p.id.trim().is_empty() {
                return Err(invalid("provider id must not be empty", format!("providers[{}].id", i)));
            }
            if !seen.insert(p.id.as_str()) {
                return Err(invalid(
                    format!("duplicate provider id '{}'", p.id),
                    format!("providers[{}].id", i),
                ));
            }
            if let Err(e) = url::Url::parse(&p.base_url) {
                return Err(invalid(
                    format!("invalid base_url '{}': {}", p.base_url, e),
                    format!("providers[{}].base_url", i),
                ));
            }
            if p.model.trim().is_empty() {
                return Err(invalid("model must not be empty", format!("providers[{}].model", i)));
            }
        }
        if self.circuit.failure_threshold == 0 {
            return Err(invalid("must be at least 1", "circuit.failure_threshold"));
        }
        if !(0.0..=1.0).contains(&self.circuit.min_health_score) {
            return Err(invalid("must be within [0, 1]", "circuit.min_health_score"));
        }
        if !(0.0..=1.0).contains(&self.selection.recency_penalty) {
            return Err(invalid("must be within [0, 1]", "selection.recency_penalty"));
        }
        Ok(())
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.attempt_timeout_ms > 0).then(|| Duration::from_millis(self.attempt_timeout_ms))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn invalid(message: impl Into<String>, field: impl Into<String>) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("router_config"),
    )
}
