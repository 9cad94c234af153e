//! 路由入口：选择候选链、驱动回退编排并保存成功的回复。
//!
//! The router call surface.
//!
//! [`ProviderRouter::route_and_save_message`] is the single entry point a UI or IPC
//! layer calls per user turn. It gathers candidates from the registry, the health
//! tracker and the credential source, asks the selector for a chain, runs the
//! [`Orchestrator`] and persists the winning reply.
//!
//! ```rust,no_run
//! use provider_router::{Message, ProviderRouter, RouterConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> provider_router::Result<()> {
//! let config = RouterConfig::load("router.yaml")?;
//! let router = ProviderRouter::builder().from_config(&config)?.build()?;
//!
//! let outcome = router
//!     .route_and_save_message("conv-1", vec![Message::user("Hello")], CancellationToken::new(), None)
//!     .await;
//! println!("{:?}", outcome.response());
//! # Ok(())
//! # }
//! ```

pub mod orchestrator;

pub use orchestrator::{
    AttemptState, ChainOutcome, Orchestrator, RelayEvent, RelaySender, RouteFailure,
    RoutingAttempt, Transition, NO_PROVIDER_AVAILABLE,
};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::RouterConfig;
use crate::credentials::{CachedCredentials, CredentialProvider, KeyringCredentials};
use crate::drivers::{ConnectionTest, ProviderAdapter};
use crate::health::{HealthReport, HealthStore, HealthTracker, InMemoryHealthStore};
use crate::normalize::{ErrorKind, NormalizedError};
use crate::registry::AdapterRegistry;
use crate::resilience::CircuitPolicy;
use crate::routing::{Candidate, CandidateSelector, RankedCandidate, SelectionConfig};
use crate::store::{AssistantMessage, InMemoryMessageStore, MessageStore};
use crate::telemetry::{EventStore, InMemoryEventStore};
use crate::types::chunk::{FinishReason, Usage};
use crate::types::message::{ChatRequest, Message};
use crate::utils::{elapsed_ms, now_ms};
use crate::{Error, ErrorContext, Result};

/// Terminal result of one routing call.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Succeeded {
        message_id: String,
        provider_id: String,
        content: String,
        usage: Usage,
        finish_reason: FinishReason,
        attempts: u32,
    },
    Failed {
        error: RouteFailure,
        attempts: u32,
    },
    Cancelled {
        provider_id: Option<String>,
        attempts: u32,
    },
}

impl RouteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RouteOutcome::Succeeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RouteOutcome::Cancelled { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RouteOutcome::Succeeded { attempts, .. }
            | RouteOutcome::Failed { attempts, .. }
            | RouteOutcome::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Flattened shape for the IPC boundary.
    pub fn response(&self) -> RouteResponse {
        RouteResponse::from(self)
    }
}

/// `{ success, message_id?, provider_id?, error? }` as handed to a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NormalizedError>,
    pub cancelled: bool,
}

impl From<&RouteOutcome> for RouteResponse {
    fn from(outcome: &RouteOutcome) -> Self {
        match outcome {
            RouteOutcome::Succeeded {
                message_id,
                provider_id,
                ..
            } => Self {
                success: true,
                message_id: Some(message_id.clone()),
                provider_id: Some(provider_id.clone()),
                error: None,
                cancelled: false,
            },
            RouteOutcome::Failed { error, .. } => Self {
                success: false,
                message_id: None,
                provider_id: None,
                error: Some(error.normalized()),
                cancelled: false,
            },
            RouteOutcome::Cancelled { provider_id, .. } => Self {
                success: false,
                message_id: None,
                provider_id: provider_id.clone(),
                error: None,
                cancelled: true,
            },
        }
    }
}

/// Cancellation handle tracked per conversation, tagged with the call that owns it.
#[derive(Debug, Clone)]
struct ActiveCall {
    generation: u64,
    token: CancellationToken,
}

pub struct ProviderRouter {
    registry: Arc<AdapterRegistry>,
    credentials: Arc<dyn CredentialProvider>,
    tracker: HealthTracker,
    events: Arc<dyn EventStore>,
    messages: Arc<dyn MessageStore>,
    selector: CandidateSelector,
    orchestrator: Orchestrator,
    active: Mutex<HashMap<String, ActiveCall>>,
    generation: AtomicU64,
}

impl ProviderRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &HealthTracker {
        &self.tracker
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    /// Run one user turn through the fallback chain and persist the reply.
    ///
    /// `cancel` becomes the tracked handle for `conversation_id`, replacing (not
    /// firing) any handle left by an earlier call. Deltas are relayed on `relay`
    /// while they stream.
    pub async fn route_and_save_message(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        cancel: CancellationToken,
        relay: Option<RelaySender>,
    ) -> RouteOutcome {
        let generation = self.track(conversation_id, cancel.clone());
        let outcome = self
            .route_inner(conversation_id, messages, cancel, relay.as_ref())
            .await;
        self.untrack(conversation_id, generation);
        outcome
    }

    async fn route_inner(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        cancel: CancellationToken,
        relay: Option<&RelaySender>,
    ) -> RouteOutcome {
        let started = Instant::now();
        let chain = self.preview_chain(conversation_id).await;
        let message_id = uuid::Uuid::new_v4().to_string();
        debug!(
            conversation_id,
            message_id = %message_id,
            chain = ?chain,
            "Routing message"
        );

        let attempt = RoutingAttempt::new(conversation_id, &message_id, chain, cancel);
        match self
            .orchestrator
            .run_chain(attempt, ChatRequest::new(messages), relay)
            .await
        {
            ChainOutcome::Succeeded {
                provider_id,
                result,
                attempts,
            } => {
                let reply = AssistantMessage {
                    id: message_id.clone(),
                    conversation_id: conversation_id.to_string(),
                    provider_id: provider_id.clone(),
                    content: result.content.clone(),
                    usage: result.usage,
                    finish_reason: result.finish_reason,
                    latency_ms: result.latency_ms,
                    created_at_ms: now_ms(),
                };
                match self.messages.save_assistant_message(reply).await {
                    Ok(stored_id) => {
                        debug!(
                            conversation_id,
                            message_id = %stored_id,
                            provider_id = %provider_id,
                            total_ms = elapsed_ms(started),
                            "Reply saved"
                        );
                        RouteOutcome::Succeeded {
                            message_id: stored_id,
                            provider_id,
                            content: result.content,
                            usage: result.usage,
                            finish_reason: result.finish_reason,
                            attempts,
                        }
                    }
                    Err(e) => {
                        error!(conversation_id, provider_id = %provider_id, error = %e, "Failed to save reply");
                        RouteOutcome::Failed {
                            error: RouteFailure::Persistence(e.to_string()),
                            attempts,
                        }
                    }
                }
            }
            ChainOutcome::Failed { error, attempts } => RouteOutcome::Failed { error, attempts },
            ChainOutcome::Cancelled {
                provider_id,
                attempts,
            } => RouteOutcome::Cancelled {
                provider_id,
                attempts,
            },
        }
    }

    fn track(&self, conversation_id: &str, token: CancellationToken) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        match self.active.lock() {
            Ok(mut active) => {
                active.insert(
                    conversation_id.to_string(),
                    ActiveCall { generation, token },
                );
            }
            Err(_) => warn!(conversation_id, "Active call table poisoned; call is not cancellable"),
        }
        generation
    }

    fn untrack(&self, conversation_id: &str, generation: u64) {
        if let Ok(mut active) = self.active.lock() {
            if active.get(conversation_id).map(|c| c.generation) == Some(generation) {
                active.remove(conversation_id);
            }
        }
    }

    /// Fire the tracked handle for a conversation. Returns whether one was tracked.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let token = self
            .active
            .lock()
            .ok()
            .and_then(|a| a.get(conversation_id).map(|c| c.token.clone()));
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active
            .lock()
            .map(|a| a.contains_key(conversation_id))
            .unwrap_or(false)
    }

    async fn candidates(&self) -> Vec<Candidate> {
        let ids = self.registry.ids();
        // without health records no circuit can be checked, so nothing is selectable
        let mut health = match self.tracker.snapshot(&ids).await {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "Health snapshot failed; no provider is selectable");
                return Vec::new();
            }
        };
        self.registry
            .iter()
            .map(|p| {
                let id = p.adapter.provider_id();
                let record = health
                    .remove(id)
                    .unwrap_or_else(|| crate::health::ProviderHealth::new(id));
                Candidate::new(id, record)
                    .with_priority(p.priority)
                    .with_credential(self.credentials.has_credential(id))
            })
            .collect()
    }

    async fn last_provider(&self, conversation_id: &str) -> Option<String> {
        match self.messages.last_assistant_provider(conversation_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(conversation_id, error = %e, "Cannot read last provider; no recency penalty");
                None
            }
        }
    }

    /// The chain a call for this conversation would try right now.
    pub async fn preview_chain(&self, conversation_id: &str) -> Vec<String> {
        let candidates = self.candidates().await;
        let last = self.last_provider(conversation_id).await;
        self.selector
            .select_chain(&candidates, last.as_deref(), now_ms())
    }

    /// Every candidate with its score and exclusion reason, excluded ones last.
    pub async fn rank(&self, conversation_id: &str) -> Vec<RankedCandidate> {
        let candidates = self.candidates().await;
        let last = self.last_provider(conversation_id).await;
        self.selector.rank(&candidates, last.as_deref(), now_ms())
    }

    pub async fn health_report(&self) -> Result<Vec<HealthReport>> {
        self.tracker.report(&self.registry.ids()).await
    }

    pub async fn reset_health(&self, provider_id: &str) -> Result<()> {
        self.tracker.reset(provider_id).await
    }

    /// Drop any remembered credential for a provider so the next call reads it afresh.
    pub fn refresh_credential(&self, provider_id: &str) {
        self.credentials.invalidate(provider_id);
    }

    /// Validate a provider's credential without running a generation.
    pub async fn test_connection(&self, provider_id: &str) -> ConnectionTest {
        let Some(adapter) = self.registry.adapter(provider_id) else {
            return ConnectionTest::failed(
                0,
                NormalizedError::unknown(format!("unknown provider '{}'", provider_id)),
            );
        };
        match self.credentials.credential(provider_id) {
            Some(credential) => adapter.test_connection(&credential).await,
            None => ConnectionTest::failed(
                0,
                NormalizedError::of_kind(ErrorKind::Auth, "missing credential"),
            ),
        }
    }
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("providers", &self.registry.ids())
            .field("selector", &self.selector)
            .field("tracker", &self.tracker)
            .finish()
    }
}

/// Builder for [`ProviderRouter`].
///
/// Defaults: in-memory health, event and message stores; keyring-then-env
/// credentials; circuit policy from the environment; 60s idle attempt timeout.
pub struct RouterBuilder {
    registry: AdapterRegistry,
    credentials: Option<Arc<dyn CredentialProvider>>,
    health_store: Option<Arc<dyn HealthStore>>,
    event_store: Option<Arc<dyn EventStore>>,
    message_store: Option<Arc<dyn MessageStore>>,
    circuit_policy: Option<CircuitPolicy>,
    selection: SelectionConfig,
    attempt_timeout: Option<Duration>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            registry: AdapterRegistry::new(),
            credentials: None,
            health_store: None,
            event_store: None,
            message_store: None,
            circuit_policy: None,
            selection: SelectionConfig::default(),
            attempt_timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Adapters, circuit policy, selection and timeout from a loaded config.
    pub fn from_config(mut self, config: &RouterConfig) -> Result<Self> {
        for p in AdapterRegistry::from_config(config)?.iter() {
            self.registry.register(p.adapter.clone(), p.priority);
        }
        self.circuit_policy = Some(config.circuit.to_policy());
        self.selection = config.selection.clone();
        self.attempt_timeout = config.attempt_timeout();
        Ok(self)
    }

    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>, priority: i32) -> Self {
        self.registry.register(adapter, priority);
        self
    }

    pub fn registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn health_store(mut self, store: Arc<dyn HealthStore>) -> Self {
        self.health_store = Some(store);
        self
    }

    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    pub fn circuit_policy(mut self, policy: CircuitPolicy) -> Self {
        self.circuit_policy = Some(policy);
        self
    }

    pub fn selection(mut self, selection: SelectionConfig) -> Self {
        self.selection = selection;
        self
    }

    /// Idle limit between chunks of one attempt. `None` waits forever.
    pub fn attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ProviderRouter> {
        if self.registry.is_empty() {
            return Err(Error::configuration_with_context(
                "no providers registered",
                ErrorContext::new()
                    .with_field_path("providers")
                    .with_source("router_builder"),
            ));
        }
        let credentials: Arc<dyn CredentialProvider> = match self.credentials {
            Some(credentials) => credentials,
            None => {
                let ids = self.registry.ids();
                Arc::new(
                    CachedCredentials::new(Arc::new(KeyringCredentials))
                        .preload(ids.iter().map(String::as_str)),
                )
            }
        };
        let registry = Arc::new(self.registry);
        let policy = self.circuit_policy.unwrap_or_else(CircuitPolicy::from_env);
        let tracker = HealthTracker::new(
            self.health_store
                .unwrap_or_else(|| Arc::new(InMemoryHealthStore::new())),
            policy,
        );
        let events = self
            .event_store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::default()));
        let messages = self
            .message_store
            .unwrap_or_else(|| Arc::new(InMemoryMessageStore::new()));
        let orchestrator = Orchestrator::new(
            registry.clone(),
            credentials.clone(),
            tracker.clone(),
            events.clone(),
            self.attempt_timeout,
        );
        Ok(ProviderRouter {
            registry,
            credentials,
            tracker,
            events,
            messages,
            selector: CandidateSelector::new(self.selection),
            orchestrator,
            active: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
