//! 路由事件模块：记录每次路由决策的审计轨迹（尝试、成功、失败、回退、耗尽）。
//!
//! Router event log.
//!
//! Every routing call leaves an append-only trail of [`RouterEvent`]s. Events are
//! never mutated after insertion; they are used for diagnostics and to audit why a
//! reply came from a given provider.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RouterEvent`] | One record of the trail |
//! | [`EventStore`] | Trait for event destinations |
//! | [`InMemoryEventStore`] | Bounded in-process store, used by tests and the CLI |
//! | [`TracingEventStore`] | Emits events as `tracing` records, keeps nothing |
//! | [`NoopEventStore`] | Discards everything |

use crate::normalize::{ErrorKind, NormalizedError};
use crate::utils::now_ms;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterEventType {
    Attempt,
    Success,
    Failure,
    Fallback,
    Exhaust,
}

impl RouterEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouterEventType::Attempt => "attempt",
            RouterEventType::Success => "success",
            RouterEventType::Failure => "failure",
            RouterEventType::Fallback => "fallback",
            RouterEventType::Exhaust => "exhaust",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterEvent {
    /// Assigned on construction; returned by [`EventStore::log`].
    pub id: String,
    pub event_type: RouterEventType,
    pub conversation_id: String,
    pub message_id: String,
    pub provider_id: Option<String>,
    /// 1-based within one routing call. 0 for an exhaust with an empty chain.
    pub attempt_number: u32,
    pub latency_ms: Option<u64>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub created_at_ms: u64,
}

impl RouterEvent {
    pub fn new(
        event_type: RouterEventType,
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            provider_id: None,
            attempt_number: 0,
            latency_ms: None,
            error_kind: None,
            error_message: None,
            created_at_ms: now_ms(),
        }
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_error(mut self, error: &NormalizedError) -> Self {
        self.error_kind = Some(error.kind());
        self.error_message = Some(error.message().to_string());
        self
    }

    pub fn with_created_at(mut self, created_at_ms: u64) -> Self {
        self.created_at_ms = created_at_ms;
        self
    }
}

/// Append-only destination for router events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event. Returns its id.
    async fn log(&self, event: RouterEvent) -> Result<String>;

    /// Most recent first.
    async fn get_recent(&self, limit: usize) -> Result<Vec<RouterEvent>>;

    /// All events for one routing call, in insertion order.
    async fn get_by_message(&self, message_id: &str) -> Result<Vec<RouterEvent>>;

    /// Most recent first.
    async fn get_by_provider(&self, provider_id: &str, limit: usize) -> Result<Vec<RouterEvent>>;

    /// Drop events older than `days_to_keep` days. Returns how many were removed.
    async fn cleanup(&self, days_to_keep: u32) -> Result<usize>;
}

/// Discards every event.
pub struct NoopEventStore;

#[async_trait]
impl EventStore for NoopEventStore {
    async fn log(&self, event: RouterEvent) -> Result<String> {
        Ok(event.id)
    }
    async fn get_recent(&self, _: usize) -> Result<Vec<RouterEvent>> {
        Ok(Vec::new())
    }
    async fn get_by_message(&self, _: &str) -> Result<Vec<RouterEvent>> {
        Ok(Vec::new())
    }
    async fn get_by_provider(&self, _: &str, _: usize) -> Result<Vec<RouterEvent>> {
        Ok(Vec::new())
    }
    async fn cleanup(&self, _: u32) -> Result<usize> {
        Ok(0)
    }
}

pub fn noop_store() -> Arc<dyn EventStore> {
    Arc::new(NoopEventStore)
}

/// Writes each event as a structured `tracing` record under the `router_events` target.
#[derive(Debug, Default)]
pub struct TracingEventStore;

#[async_trait]
impl EventStore for TracingEventStore {
    async fn log(&self, event: RouterEvent) -> Result<String> {
        tracing::info!(
            target: "router_events",
            event_type = event.event_type.as_str(),
            conversation_id = %event.conversation_id,
            message_id = %event.message_id,
            provider_id = event.provider_id.as_deref().unwrap_or("-"),
            attempt = event.attempt_number,
            latency_ms = event.latency_ms,
            error_kind = event.error_kind.map(|k| k.name()),
            "router event"
        );
        Ok(event.id)
    }
    async fn get_recent(&self, _: usize) -> Result<Vec<RouterEvent>> {
        Ok(Vec::new())
    }
    async fn get_by_message(&self, _: &str) -> Result<Vec<RouterEvent>> {
        Ok(Vec::new())
    }
    async fn get_by_provider(&self, _: &str, _: usize) -> Result<Vec<RouterEvent>> {
        Ok(Vec::new())
    }
    async fn cleanup(&self, _: u32) -> Result<usize> {
        Ok(0)
    }
}

/// Bounded in-process store. The oldest events are dropped past `max_events`.
pub struct InMemoryEventStore {
    events: RwLock<VecDeque<RouterEvent>>,
    max_events: usize,
}

impl InMemoryEventStore {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            max_events: max_events.max(1),
        }
    }

    fn poisoned() -> Error {
        Error::store_with_context(
            "event log lock poisoned",
            ErrorContext::new().with_source("event_store"),
        )
    }

    /// Snapshot of all events, oldest first.
    pub fn events(&self) -> Result<Vec<RouterEvent>> {
        Ok(self
            .events
            .read()
            .map_err(|_| Self::poisoned())?
            .iter()
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn log(&self, event: RouterEvent) -> Result<String> {
        let id = event.id.clone();
        let mut events = self.events.write().map_err(|_| Self::poisoned())?;
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
        Ok(id)
    }

    async fn get_recent(&self, limit: usize) -> Result<Vec<RouterEvent>> {
        let events = self.events.read().map_err(|_| Self::poisoned())?;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }

    async fn get_by_message(&self, message_id: &str) -> Result<Vec<RouterEvent>> {
        let events = self.events.read().map_err(|_| Self::poisoned())?;
        Ok(events
            .iter()
            .filter(|e| e.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn get_by_provider(&self, provider_id: &str, limit: usize) -> Result<Vec<RouterEvent>> {
        let events = self.events.read().map_err(|_| Self::poisoned())?;
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.provider_id.as_deref() == Some(provider_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn cleanup(&self, days_to_keep: u32) -> Result<usize> {
        let cutoff = now_ms().saturating_sub(u64::from(days_to_keep).saturating_mul(DAY_MS));
        let mut events = self.events.write().map_err(|_| Self::poisoned())?;
        let before = events.len();
        events.retain(|e| e.created_at_ms >= cutoff);
        Ok(before - events.len())
    }
}
