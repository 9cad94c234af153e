//! Shared fixtures: a scripted in-process adapter and router wiring.

#![allow(dead_code)]

use async_trait::async_trait;
use provider_router::credentials::StaticCredentials;
use provider_router::drivers::{AdapterCapabilities, ChunkStream, ConnectionTest, ProviderAdapter};
use provider_router::router::RelayEvent;
use provider_router::store::InMemoryMessageStore;
use provider_router::telemetry::InMemoryEventStore;
use provider_router::{
    Credential, FinishReason, NormalizedError, ProviderRouter, RouterBuilder, RouterEvent,
    RouterEventType, StreamChunk, Usage,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// One step of a scripted generation.
#[derive(Debug, Clone)]
pub enum Step {
    Delta(&'static str),
    Done,
    Fail(NormalizedError),
    /// Fire the call's own cancellation token, then fail.
    CancelThenFail(NormalizedError),
    /// Produce nothing until cancelled.
    Hang,
    Sleep(Duration),
}

/// Adapter that replays one script per `generate` call, then repeats `fallback`.
#[derive(Debug)]
pub struct ScriptedAdapter {
    id: String,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    fallback: Vec<Step>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(id: &str, fallback: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn replying(id: &str, text: &'static str) -> Arc<Self> {
        Self::new(id, vec![Step::Delta(text), Step::Done])
    }

    pub fn failing(id: &str, error: NormalizedError) -> Arc<Self> {
        Self::new(id, vec![Step::Fail(error)])
    }

    pub fn scripted(id: &str, scripts: Vec<Vec<Step>>) -> Arc<Self> {
        let adapter = Self::new(id, vec![Step::Delta("ok"), Step::Done]);
        adapter.scripts.lock().unwrap().extend(scripts);
        adapter
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Vec<Step> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            max_context_tokens: None,
            default_model: "scripted".into(),
            models: vec!["scripted".into()],
        }
    }

    fn generate(
        &self,
        _request: provider_router::ChatRequest,
        _credential: Credential,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let script = self.next_script();
        Box::pin(async_stream::stream! {
            for step in script {
                if cancel.is_cancelled() {
                    return;
                }
                match step {
                    Step::Delta(text) => yield StreamChunk::delta(text),
                    Step::Done => yield StreamChunk::done(Usage::new(3, 5), FinishReason::Stop),
                    Step::Fail(error) => yield StreamChunk::error(error),
                    Step::CancelThenFail(error) => {
                        cancel.cancel();
                        yield StreamChunk::error(error);
                    }
                    Step::Hang => {
                        cancel.cancelled().await;
                        return;
                    }
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                }
            }
        })
    }

    async fn test_connection(&self, _credential: &Credential) -> ConnectionTest {
        ConnectionTest::ok(0)
    }
}

pub struct Harness {
    pub router: ProviderRouter,
    pub events: Arc<InMemoryEventStore>,
    pub messages: Arc<InMemoryMessageStore>,
}

/// Builder with in-memory stores and a key for every listed provider.
pub fn builder(adapters: &[(Arc<ScriptedAdapter>, i32)]) -> (RouterBuilder, Arc<InMemoryEventStore>, Arc<InMemoryMessageStore>) {
    let events = Arc::new(InMemoryEventStore::default());
    let messages = Arc::new(InMemoryMessageStore::new());
    let mut credentials = StaticCredentials::new();
    let mut builder = RouterBuilder::new()
        .event_store(events.clone())
        .message_store(messages.clone())
        .circuit_policy(provider_router::resilience::CircuitPolicy::default())
        .attempt_timeout(None);
    for (adapter, priority) in adapters {
        credentials = credentials.with(adapter.provider_id(), "sk-test");
        builder = builder.adapter(adapter.clone(), *priority);
    }
    (builder.credentials(Arc::new(credentials)), events, messages)
}

pub fn harness(adapters: &[(Arc<ScriptedAdapter>, i32)]) -> Harness {
    let (builder, events, messages) = builder(adapters);
    Harness {
        router: builder.build().unwrap(),
        events,
        messages,
    }
}

pub fn user(text: &str) -> Vec<provider_router::Message> {
    vec![provider_router::Message::user(text)]
}

/// `(type, attempt, provider)` triples in log order.
pub fn trail(events: &InMemoryEventStore) -> Vec<(RouterEventType, u32, Option<String>)> {
    events
        .events()
        .unwrap()
        .into_iter()
        .map(|e: RouterEvent| (e.event_type, e.attempt_number, e.provider_id))
        .collect()
}

pub fn types(events: &InMemoryEventStore) -> Vec<RouterEventType> {
    trail(events).into_iter().map(|(t, _, _)| t).collect()
}

/// Wait for the first relayed delta.
pub async fn first_delta(rx: &mut UnboundedReceiver<RelayEvent>) -> String {
    while let Some(event) = rx.recv().await {
        if let RelayEvent::Delta { text, .. } = event {
            return text;
        }
    }
    panic!("relay closed before any delta");
}
