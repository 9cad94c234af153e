//! Credential lookup.
//!
//! The router only asks one question: does provider X have a usable credential?
//! Key management itself lives outside this crate.

use keyring::Entry;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Keyring service name credentials are stored under.
pub const KEYRING_SERVICE: &str = "provider-router";

/// An API credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Source of per-provider credentials.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self, provider_id: &str) -> Option<Credential>;

    fn has_credential(&self, provider_id: &str) -> bool {
        self.credential(provider_id).map(|c| !c.is_empty()).unwrap_or(false)
    }

    /// Forget anything remembered about this provider's credential.
    fn invalidate(&self, _provider_id: &str) {}
}

/// Fixed map, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.keys.insert(provider_id.into(), Credential::new(secret));
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self, provider_id: &str) -> Option<Credential> {
        self.keys.get(provider_id).cloned()
    }
}

/// `{PROVIDER_ID}_API_KEY`, with non-alphanumerics mapped to `_`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn var_name(provider_id: &str) -> String {
        let id: String = provider_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}_API_KEY", id)
    }
}

impl CredentialProvider for EnvCredentials {
    fn credential(&self, provider_id: &str) -> Option<Credential> {
        env::var(Self::var_name(provider_id))
            .ok()
            .map(Credential::new)
            .filter(|c| !c.is_empty())
    }
}

/// OS keyring first, then the environment.
#[derive(Debug, Clone, Default)]
pub struct KeyringCredentials;

impl CredentialProvider for KeyringCredentials {
    fn credential(&self, provider_id: &str) -> Option<Credential> {
        if let Ok(entry) = Entry::new(KEYRING_SERVICE, provider_id) {
            if let Ok(key) = entry.get_password() {
                let credential = Credential::new(key);
                if !credential.is_empty() {
                    return Some(credential);
                }
            }
        }
        EnvCredentials.credential(provider_id)
    }
}

/// Remembers each provider's lookup, hit or miss, so a slow source (the OS keyring)
/// is read once per provider rather than on every routing call.
pub struct CachedCredentials {
    inner: Arc<dyn CredentialProvider>,
    cache: RwLock<HashMap<String, Option<Credential>>>,
}

impl CachedCredentials {
    pub fn new(inner: Arc<dyn CredentialProvider>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the given providers up front.
    pub fn preload<'a>(self, provider_ids: impl IntoIterator<Item = &'a str>) -> Self {
        for id in provider_ids {
            self.credential(id);
        }
        self
    }
}

impl CredentialProvider for CachedCredentials {
    fn credential(&self, provider_id: &str) -> Option<Credential> {
        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(provider_id) {
                return hit.clone();
            }
        }
        let resolved = self.inner.credential(provider_id);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(provider_id.to_string(), resolved.clone());
        }
        resolved
    }

    fn invalidate(&self, provider_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(provider_id);
        }
        self.inner.invalidate(provider_id);
    }
}

impl fmt::Debug for CachedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.cache.read().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("CachedCredentials").field("cached", &cached).finish()
    }
}
