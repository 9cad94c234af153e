//! Health persistence.

use super::{CircuitChange, HealthUpdate, ProviderHealth};
use crate::error::Error;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Storage for per-provider health records.
///
/// `update_health` must apply the update as one read-modify-write per
/// provider: two concurrent outcomes for the same provider both land.
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn get_health(&self, provider_id: &str) -> Result<Option<ProviderHealth>>;

    async fn get_all_health(&self) -> Result<Vec<ProviderHealth>>;

    /// Apply an outcome, creating the record if missing.
    ///
    /// Returns the new record and the circuit transition this update caused,
    /// both taken inside the same read-modify-write.
    async fn update_health(
        &self,
        provider_id: &str,
        update: HealthUpdate,
    ) -> Result<(ProviderHealth, CircuitChange)>;

    async fn reset_health(&self, provider_id: &str) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// In-process store. Each provider record sits behind its own mutex.
#[derive(Default)]
pub struct InMemoryHealthStore {
    records: RwLock<HashMap<String, Arc<Mutex<ProviderHealth>>>>,
}

impl InMemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, provider_id: &str) -> Result<Arc<Mutex<ProviderHealth>>> {
        if let Some(slot) = self
            .records
            .read()
            .map_err(|_| Error::poisoned("health_store"))?
            .get(provider_id)
        {
            return Ok(slot.clone());
        }
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::poisoned("health_store"))?;
        Ok(records
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::new(provider_id))))
            .clone())
    }
}

#[async_trait]
impl HealthStore for InMemoryHealthStore {
    async fn get_health(&self, provider_id: &str) -> Result<Option<ProviderHealth>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::poisoned("health_store"))?;
        match records.get(provider_id) {
            Some(slot) => {
                let health = slot.lock().map_err(|_| Error::poisoned("health_store"))?;
                Ok(Some(health.clone()))
            }
            None => Ok(None),
        }
    }

    async fn get_all_health(&self) -> Result<Vec<ProviderHealth>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::poisoned("health_store"))?;
        let mut all = Vec::with_capacity(records.len());
        for slot in records.values() {
            let health = slot.lock().map_err(|_| Error::poisoned("health_store"))?;
            all.push(health.clone());
        }
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        Ok(all)
    }

    async fn update_health(
        &self,
        provider_id: &str,
        update: HealthUpdate,
    ) -> Result<(ProviderHealth, CircuitChange)> {
        let slot = self.slot(provider_id)?;
        let mut health = slot.lock().map_err(|_| Error::poisoned("health_store"))?;
        let change = health.apply(&update);
        Ok((health.clone(), change))
    }

    async fn reset_health(&self, provider_id: &str) -> Result<()> {
        self.records
            .write()
            .map_err(|_| Error::poisoned("health_store"))?
            .remove(provider_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
