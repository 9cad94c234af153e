//! Fallback orchestration for one routing call.
//!
//! [`RoutingAttempt`] is the state machine. Each transition returns the
//! [`RouterEvent`] it implies, so the audit trail can be checked without any I/O:
//!
//! ```text
//! Idle -> Attempting(i) -> Streaming(i) -> Succeeded
//!                       \-> Failed(i) -> Attempting(i+1) | Exhausted | Cancelled
//! ```
//!
//! [`Orchestrator::run_chain`] drives the machine against real adapters, the health
//! tracker and the event store.

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialProvider;
use crate::drivers::terminated;
use crate::health::HealthTracker;
use crate::normalize::{ErrorKind, NormalizedError};
use crate::registry::AdapterRegistry;
use crate::telemetry::{EventStore, RouterEvent, RouterEventType};
use crate::types::chunk::{GenerationResult, StreamChunk};
use crate::types::message::ChatRequest;
use crate::utils::elapsed_ms;

/// Message of the synthetic error returned when the chain is empty.
pub const NO_PROVIDER_AVAILABLE: &str = "no available provider";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "attempt", rename_all = "snake_case")]
pub enum AttemptState {
    Idle,
    Attempting(u32),
    Streaming(u32),
    Failed(u32),
    Succeeded(u32),
    Exhausted,
    Cancelled,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded(_) | AttemptState::Exhausted | AttemptState::Cancelled
        )
    }
}

/// What follows a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Fallback(RouterEvent),
    Exhausted(RouterEvent),
    Cancelled,
}

/// Progress sent to the caller while a call runs.
///
/// A fallback shows up as `AttemptFailed` followed by a new `AttemptStarted`;
/// text already relayed for the failed attempt is not retracted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    AttemptStarted {
        attempt_number: u32,
        provider_id: String,
    },
    Delta {
        attempt_number: u32,
        text: String,
    },
    AttemptFailed {
        attempt_number: u32,
        provider_id: String,
        error: NormalizedError,
    },
}

pub type RelaySender = mpsc::UnboundedSender<RelayEvent>;

/// Ephemeral state of one routing call.
#[derive(Debug)]
pub struct RoutingAttempt {
    conversation_id: String,
    message_id: String,
    chain: Vec<String>,
    index: usize,
    content: String,
    state: AttemptState,
    cancel: CancellationToken,
    last_error: Option<NormalizedError>,
}

impl RoutingAttempt {
    pub fn new(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        chain: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            chain,
            index: 0,
            content: String::new(),
            state: AttemptState::Idle,
            cancel,
            last_error: None,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn last_error(&self) -> Option<&NormalizedError> {
        self.last_error.as_ref()
    }

    /// 1-based number of the current candidate.
    pub fn attempt_number(&self) -> u32 {
        self.index as u32 + 1
    }

    pub fn current_provider(&self) -> Option<&str> {
        self.chain.get(self.index).map(String::as_str)
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.chain.len()
    }

    fn event(&self, event_type: RouterEventType) -> RouterEvent {
        let event = RouterEvent::new(event_type, &self.conversation_id, &self.message_id);
        match self.current_provider() {
            Some(p) => event.with_provider(p).with_attempt(self.attempt_number()),
            None => event,
        }
    }

    /// Empty chain: straight to exhausted, with no attempt number.
    pub fn exhaust_empty(&mut self) -> RouterEvent {
        self.state = AttemptState::Exhausted;
        self.last_error = Some(NormalizedError::unknown(NO_PROVIDER_AVAILABLE));
        RouterEvent::new(RouterEventType::Exhaust, &self.conversation_id, &self.message_id)
    }

    /// Enter `Attempting(i)` for the current candidate. `None` once the chain is used up.
    pub fn begin(&mut self) -> Option<RouterEvent> {
        self.current_provider()?;
        self.content.clear();
        self.state = AttemptState::Attempting(self.attempt_number());
        Some(self.event(RouterEventType::Attempt))
    }

    pub fn on_delta(&mut self, text: &str) {
        self.state = AttemptState::Streaming(self.attempt_number());
        self.content.push_str(text);
    }

    pub fn has_streamed(&self) -> bool {
        matches!(self.state, AttemptState::Streaming(_))
    }

    pub fn succeed(&mut self, latency_ms: u64) -> RouterEvent {
        self.state = AttemptState::Succeeded(self.attempt_number());
        self.event(RouterEventType::Success).with_latency(latency_ms)
    }

    pub fn fail(&mut self, error: &NormalizedError, latency_ms: u64) -> RouterEvent {
        self.state = AttemptState::Failed(self.attempt_number());
        self.last_error = Some(error.clone());
        self.event(RouterEventType::Failure)
            .with_latency(latency_ms)
            .with_error(error)
    }

    /// After a failure: cancel wins, then fall back, else exhaust.
    pub fn advance(&mut self) -> Transition {
        if self.cancel.is_cancelled() {
            self.state = AttemptState::Cancelled;
            return Transition::Cancelled;
        }
        if self.is_last() {
            self.state = AttemptState::Exhausted;
            let mut event = self.event(RouterEventType::Exhaust);
            if let Some(err) = &self.last_error {
                event = event.with_error(err);
            }
            return Transition::Exhausted(event);
        }
        let event = match &self.last_error {
            Some(err) => self.event(RouterEventType::Fallback).with_error(err),
            None => self.event(RouterEventType::Fallback),
        };
        self.index += 1;
        Transition::Fallback(event)
    }

    pub fn mark_cancelled(&mut self) {
        self.state = AttemptState::Cancelled;
    }
}

/// Why a call ended without a reply.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "reason", content = "error", rename_all = "snake_case")]
pub enum RouteFailure {
    #[error("{}", NO_PROVIDER_AVAILABLE)]
    NoProviderAvailable,
    #[error("all providers failed: {0}")]
    Exhausted(NormalizedError),
    #[error("reply could not be saved: {0}")]
    Persistence(String),
}

impl RouteFailure {
    /// The normalized error to show the caller.
    pub fn normalized(&self) -> NormalizedError {
        match self {
            RouteFailure::NoProviderAvailable => NormalizedError::unknown(NO_PROVIDER_AVAILABLE),
            RouteFailure::Exhausted(e) => e.clone(),
            RouteFailure::Persistence(msg) => NormalizedError::unknown(msg.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Succeeded {
        provider_id: String,
        result: GenerationResult,
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

enum AttemptResult {
    Done(GenerationResult),
    Error { error: NormalizedError, latency_ms: u64 },
    Cancelled,
}

/// Drives [`RoutingAttempt`]s against adapters, health and the event log.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<AdapterRegistry>,
    credentials: Arc<dyn CredentialProvider>,
    tracker: HealthTracker,
    events: Arc<dyn EventStore>,
    attempt_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        credentials: Arc<dyn CredentialProvider>,
        tracker: HealthTracker,
        events: Arc<dyn EventStore>,
        attempt_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            credentials,
            tracker,
            events,
            attempt_timeout,
        }
    }

    async fn emit(&self, event: RouterEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.events.log(event).await {
            warn!(event_type = event_type.as_str(), error = %e, "Failed to log router event");
        }
    }

    fn relay(relay: Option<&RelaySender>, event: RelayEvent) {
        if let Some(tx) = relay {
            // a dropped receiver only means nobody is watching
            let _ = tx.send(event);
        }
    }

    /// Run the whole chain to success, exhaustion or cancellation.
    pub async fn run_chain(
        &self,
        mut attempt: RoutingAttempt,
        request: ChatRequest,
        relay: Option<&RelaySender>,
    ) -> ChainOutcome {
        if attempt.cancel_token().is_cancelled() {
            attempt.mark_cancelled();
            return self.cancelled(&attempt, 0);
        }
        if attempt.chain().is_empty() {
            warn!(conversation_id = %attempt.conversation_id(), "No provider available");
            let event = attempt.exhaust_empty();
            self.emit(event).await;
            return ChainOutcome::Failed {
                error: RouteFailure::NoProviderAvailable,
                attempts: 0,
            };
        }

        // after the first attempt the token is checked in advance() and drive(),
        // so every logged fallback is followed by its attempt
        loop {
            let Some(event) = attempt.begin() else {
                // begin() only fails past the end, which advance() never allows
                return ChainOutcome::Failed {
                    error: RouteFailure::NoProviderAvailable,
                    attempts: attempt.index as u32,
                };
            };
            let attempt_number = attempt.attempt_number();
            let provider_id = attempt.current_provider().unwrap_or_default().to_string();
            debug!(
                conversation_id = %attempt.conversation_id(),
                provider_id = %provider_id,
                attempt = attempt_number,
                "Attempt started"
            );
            self.emit(event).await;
            Self::relay(
                relay,
                RelayEvent::AttemptStarted {
                    attempt_number,
                    provider_id: provider_id.clone(),
                },
            );

            match self.drive(&mut attempt, &provider_id, request.clone(), relay).await {
                AttemptResult::Cancelled => {
                    attempt.mark_cancelled();
                    return self.cancelled(&attempt, attempt_number);
                }
                AttemptResult::Done(result) => {
                    if let Err(e) = self
                        .tracker
                        .record_outcome(&provider_id, true, Some(result.latency_ms), None)
                        .await
                    {
                        warn!(provider_id = %provider_id, error = %e, "Failed to record success");
                    }
                    info!(
                        conversation_id = %attempt.conversation_id(),
                        provider_id = %provider_id,
                        attempt = attempt_number,
                        latency_ms = result.latency_ms,
                        total_tokens = result.usage.total_tokens,
                        "Attempt succeeded"
                    );
                    let event = attempt.succeed(result.latency_ms);
                    self.emit(event).await;
                    return ChainOutcome::Succeeded {
                        provider_id,
                        result,
                        attempts: attempt_number,
                    };
                }
                AttemptResult::Error { error, latency_ms } => {
                    // an error racing a cancel is the cancel's doing
                    if attempt.cancel_token().is_cancelled() {
                        attempt.mark_cancelled();
                        return self.cancelled(&attempt, attempt_number);
                    }
                    let sample = attempt.has_streamed().then_some(latency_ms);
                    if let Err(e) = self
                        .tracker
                        .record_outcome(&provider_id, false, sample, Some(error.kind()))
                        .await
                    {
                        warn!(provider_id = %provider_id, error = %e, "Failed to record failure");
                    }
                    log_failure(&provider_id, attempt_number, &error);
                    let event = attempt.fail(&error, latency_ms);
                    self.emit(event).await;
                    Self::relay(
                        relay,
                        RelayEvent::AttemptFailed {
                            attempt_number,
                            provider_id: provider_id.clone(),
                            error: error.clone(),
                        },
                    );

                    match attempt.advance() {
                        Transition::Fallback(event) => {
                            info!(
                                conversation_id = %attempt.conversation_id(),
                                from = %provider_id,
                                to = attempt.current_provider().unwrap_or_default(),
                                error_kind = error.kind().name(),
                                "Falling back"
                            );
                            self.emit(event).await;
                        }
                        Transition::Exhausted(event) => {
                            warn!(
                                conversation_id = %attempt.conversation_id(),
                                attempts = attempt_number,
                                error_kind = error.kind().name(),
                                "All providers failed"
                            );
                            self.emit(event).await;
                            return ChainOutcome::Failed {
                                error: RouteFailure::Exhausted(error),
                                attempts: attempt_number,
                            };
                        }
                        Transition::Cancelled => {
                            return self.cancelled(&attempt, attempt_number);
                        }
                    }
                }
            }
        }
    }

    fn cancelled(&self, attempt: &RoutingAttempt, attempts: u32) -> ChainOutcome {
        let provider_id = (attempts as usize)
            .checked_sub(1)
            .and_then(|i| attempt.chain().get(i))
            .cloned();
        info!(
            conversation_id = %attempt.conversation_id(),
            provider_id = provider_id.as_deref().unwrap_or("-"),
            attempts,
            "Routing cancelled"
        );
        ChainOutcome::Cancelled {
            provider_id,
            attempts,
        }
    }

    /// Stream one candidate to its terminal chunk, relaying deltas as they arrive.
    async fn drive(
        &self,
        attempt: &mut RoutingAttempt,
        provider_id: &str,
        request: ChatRequest,
        relay: Option<&RelaySender>,
    ) -> AttemptResult {
        let started = Instant::now();
        let attempt_number = attempt.attempt_number();

        let Some(adapter) = self.registry.adapter(provider_id) else {
            return AttemptResult::Error {
                error: NormalizedError::unknown(format!("no adapter registered for '{}'", provider_id)),
                latency_ms: 0,
            };
        };
        let Some(credential) = self.credentials.credential(provider_id) else {
            return AttemptResult::Error {
                error: NormalizedError::of_kind(ErrorKind::Auth, "missing credential"),
                latency_ms: 0,
            };
        };

        let cancel = attempt.cancel_token().clone();
        if cancel.is_cancelled() {
            return AttemptResult::Cancelled;
        }
        let mut stream = terminated(adapter.generate(request, credential, cancel.clone()));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return AttemptResult::Cancelled,
                next = next_within(&mut stream, self.attempt_timeout) => next,
            };
            let chunk = match next {
                Some(chunk) => chunk,
                None => {
                    return AttemptResult::Error {
                        error: NormalizedError::network(format!(
                            "no data from provider for {} ms",
                            self.attempt_timeout.map(|d| d.as_millis()).unwrap_or_default()
                        )),
                        latency_ms: elapsed_ms(started),
                    }
                }
            };
            match chunk {
                StreamChunk::Delta { text } => {
                    attempt.on_delta(&text);
                    Self::relay(
                        relay,
                        RelayEvent::Delta {
                            attempt_number,
                            text,
                        },
                    );
                }
                StreamChunk::Error { error } => {
                    return AttemptResult::Error {
                        error,
                        latency_ms: elapsed_ms(started),
                    }
                }
                StreamChunk::Done {
                    usage,
                    finish_reason,
                } => {
                    return AttemptResult::Done(GenerationResult {
                        content: attempt.content().to_string(),
                        usage,
                        finish_reason,
                        latency_ms: elapsed_ms(started),
                    })
                }
            }
        }
    }
}

/// Next chunk, or `None` if the idle timeout elapsed first.
///
/// `terminated` streams never end without a terminal chunk, so exhaustion maps to
/// a missing-terminal error rather than `None`.
async fn next_within(
    stream: &mut crate::drivers::ChunkStream,
    timeout: Option<Duration>,
) -> Option<StreamChunk> {
    let next = async {
        stream.next().await.unwrap_or_else(|| {
            StreamChunk::error(NormalizedError::unknown(crate::drivers::MISSING_TERMINAL))
        })
    };
    match timeout {
        Some(limit) => tokio::time::timeout(limit, next).await.ok(),
        None => Some(next.await),
    }
}

fn log_failure(provider_id: &str, attempt: u32, err: &NormalizedError) {
    let kind = err.kind();
    if kind.requires_user_action() {
        error!(provider_id, attempt, error_kind = kind.name(), error = %err, "Attempt failed");
    } else if kind.is_request_shape() {
        info!(provider_id, attempt, error_kind = kind.name(), error = %err, "Provider rejected the request");
    } else if kind == ErrorKind::Unknown {
        warn!(provider_id, attempt, error_kind = kind.name(), transient = kind.is_transient(), message = err.message(), "Attempt failed with unclassified error");
    } else {
        warn!(provider_id, attempt, error_kind = kind.name(), transient = kind.is_transient(), error = %err, "Attempt failed");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.registry.ids())
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}
