//! 适配器注册表：将提供商标识映射到具体适配器实现
//!
//! Adapter registry. Maps a provider id to the adapter that serves it, plus the
//! static priority the selector uses to break ties. Registration order is kept.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ProviderKind, RouterConfig};
use crate::drivers::{
    http, AdapterSettings, AnthropicAdapter, OpenAiCompatibleAdapter, ProviderAdapter,
};
pub use crate::drivers::AdapterCapabilities;
use crate::Result;

#[derive(Debug, Clone)]
pub struct RegisteredProvider {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub priority: i32,
}

#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    providers: Vec<RegisteredProvider>,
    index: HashMap<String, usize>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. A second registration for the same id replaces the first
    /// and keeps its position.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>, priority: i32) {
        let id = adapter.provider_id().to_string();
        let entry = RegisteredProvider { adapter, priority };
        match self.index.get(&id) {
            Some(&i) => self.providers[i] = entry,
            None => {
                self.index.insert(id, self.providers.len());
                self.providers.push(entry);
            }
        }
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>, priority: i32) -> Self {
        self.register(adapter, priority);
        self
    }

    pub fn get(&self, provider_id: &str) -> Option<&RegisteredProvider> {
        self.index.get(provider_id).map(|&i| &self.providers[i])
    }

    pub fn adapter(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.get(provider_id).map(|p| p.adapter.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.adapter.provider_id().to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.providers.iter()
    }

    pub fn capabilities(&self, provider_id: &str) -> Option<AdapterCapabilities> {
        self.get(provider_id).map(|p| p.adapter.capabilities())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// One HTTP adapter per enabled provider, all sharing a single client pool.
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let client = http::build_client()?;
        let mut registry = Self::new();
        for p in config.enabled_providers() {
            let settings = AdapterSettings::new(&p.id, &p.base_url, &p.model)
                .with_models(p.models.clone())
                .with_max_context_tokens(p.max_context_tokens);
            let adapter: Arc<dyn ProviderAdapter> = match p.kind {
                ProviderKind::Openai => {
                    Arc::new(OpenAiCompatibleAdapter::with_client(settings, client.clone()))
                }
                ProviderKind::Anthropic => {
                    Arc::new(AnthropicAdapter::with_client(settings, client.clone()))
                }
            };
            registry.register(adapter, p.priority);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai(id: &str) -> Arc<dyn ProviderAdapter> {
        Arc::new(OpenAiCompatibleAdapter::with_client(
            AdapterSettings::new(id, "http://localhost", "m"),
            reqwest::Client::new(),
        ))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = AdapterRegistry::new().with(openai("a"), 1).with(openai("b"), 2);
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.get("b").map(|p| p.priority), Some(2));
        assert!(registry.adapter("c").is_none());
        assert_eq!(registry.capabilities("a").map(|c| c.default_model), Some("m".into()));
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let registry = AdapterRegistry::new()
            .with(openai("a"), 1)
            .with(openai("b"), 1)
            .with(openai("a"), 9);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.get("a").map(|p| p.priority), Some(9));
    }

    #[test]
    fn test_from_config_skips_disabled() {
        let config = RouterConfig::from_yaml_str(
            r#"
providers:
  - {id: oa, kind: openai, base_url: "http://localhost:1/v1", model: gpt}
  - {id: an, kind: anthropic, base_url: "http://localhost:2/v1", model: claude, priority: 3}
  - {id: off, kind: openai, base_url: "http://localhost:3/v1", model: gpt, enabled: false}
"#,
        )
        .unwrap();
        let registry = AdapterRegistry::from_config(&config).unwrap();
        assert_eq!(registry.ids(), vec!["oa", "an"]);
        assert_eq!(registry.get("an").map(|p| p.priority), Some(3));
    }
}
