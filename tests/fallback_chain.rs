//! Fallback chain behaviour end to end, against scripted adapters.

mod common;

use async_trait::async_trait;
use common::{builder, harness, trail, types, user, ScriptedAdapter, Step};
use provider_router::credentials::{CachedCredentials, CredentialProvider};
use provider_router::health::{CircuitChange, HealthStore, HealthUpdate, ProviderHealth};
use provider_router::resilience::CircuitState;
use provider_router::router::{RelayEvent, RouteFailure, NO_PROVIDER_AVAILABLE};
use provider_router::store::{AssistantMessage, MessageStore};
use provider_router::{
    Credential, Error, ErrorKind, NormalizedError, RouteOutcome, RouterEventType::*,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_first_candidate_succeeds() {
    let p1 = ScriptedAdapter::new("p1", vec![Step::Delta("Hel"), Step::Delta("lo"), Step::Done]);
    let p2 = ScriptedAdapter::replying("p2", "unused");
    let h = harness(&[(p1.clone(), 2), (p2.clone(), 1)]);

    let outcome = h
        .router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;

    match &outcome {
        RouteOutcome::Succeeded {
            provider_id,
            content,
            attempts,
            usage,
            ..
        } => {
            assert_eq!(provider_id, "p1");
            assert_eq!(content, "Hello");
            assert_eq!(*attempts, 1);
            assert_eq!(usage.total_tokens, 8);
        }
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(p2.calls(), 0);
    assert_eq!(types(&h.events), vec![Attempt, Success]);

    let saved = h.messages.messages("c1");
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].provider_id, "p1");
    assert_eq!(saved[0].content, "Hello");
    assert_eq!(outcome.response().message_id.as_deref(), Some(saved[0].id.as_str()));

    let health = h.router.tracker().health_of("p1").await.unwrap();
    assert_eq!(health.success_count, 1);
    assert_eq!(health.latency_samples, 1);
}

#[tokio::test]
async fn test_falls_back_after_mid_stream_failure() {
    let p1 = ScriptedAdapter::new(
        "p1",
        vec![Step::Delta("partial"), Step::Fail(NormalizedError::network("connection reset"))],
    );
    let p2 = ScriptedAdapter::replying("p2", "from p2");
    let h = harness(&[(p1.clone(), 2), (p2.clone(), 1)]);

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let outcome = h
        .router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), Some(tx))
        .await;

    match &outcome {
        RouteOutcome::Succeeded {
            provider_id,
            content,
            attempts,
            ..
        } => {
            assert_eq!(provider_id, "p2");
            assert_eq!(content, "from p2", "partial text of a failed attempt is discarded");
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected success, got {:?}", other),
    }

    assert_eq!(
        trail(&h.events),
        vec![
            (Attempt, 1, Some("p1".into())),
            (Failure, 1, Some("p1".into())),
            (Fallback, 1, Some("p1".into())),
            (Attempt, 2, Some("p2".into())),
            (Success, 2, Some("p2".into())),
        ]
    );

    // the sender was dropped with the call, so the stream ends
    let relayed: Vec<RelayEvent> = UnboundedReceiverStream::new(rx).collect().await;
    assert!(matches!(&relayed[0], RelayEvent::AttemptStarted { attempt_number: 1, provider_id } if provider_id == "p1"));
    assert!(matches!(&relayed[1], RelayEvent::Delta { attempt_number: 1, text } if text == "partial"));
    assert!(matches!(&relayed[2], RelayEvent::AttemptFailed { attempt_number: 1, error, .. } if error.kind() == ErrorKind::Network));
    assert!(matches!(&relayed[3], RelayEvent::AttemptStarted { attempt_number: 2, .. }));
    assert!(matches!(&relayed[4], RelayEvent::Delta { attempt_number: 2, .. }));
    assert_eq!(relayed.len(), 5);

    let p1_health = h.router.tracker().health_of("p1").await.unwrap();
    assert_eq!(p1_health.failure_count, 1);
    assert_eq!(p1_health.consecutive_failures, 1);
    assert_eq!(p1_health.last_error_type, Some(ErrorKind::Network));
    assert_eq!(p1_health.latency_samples, 1, "streamed before failing");
}

#[tokio::test]
async fn test_exhaustion_surfaces_last_error() {
    let p1 = ScriptedAdapter::failing("p1", NormalizedError::of_kind(ErrorKind::RateLimit, "slow down"));
    let p2 = ScriptedAdapter::failing("p2", NormalizedError::of_kind(ErrorKind::Auth, "bad key"));
    let h = harness(&[(p1, 2), (p2, 1)]);

    let outcome = h
        .router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;

    match &outcome {
        RouteOutcome::Failed {
            error: RouteFailure::Exhausted(err),
            attempts,
        } => {
            assert_eq!(err.kind(), ErrorKind::Auth);
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(
        types(&h.events),
        vec![Attempt, Failure, Fallback, Attempt, Failure, Exhaust]
    );
    let exhaust = h.events.events().unwrap().pop().unwrap();
    assert_eq!(exhaust.error_kind, Some(ErrorKind::Auth));
    assert!(h.messages.messages("c1").is_empty());

    let response = outcome.response();
    assert!(!response.success);
    assert_eq!(response.error.map(|e| e.kind()), Some(ErrorKind::Auth));
}

#[tokio::test]
async fn test_empty_chain_is_no_provider_available() {
    let p1 = ScriptedAdapter::replying("p1", "unused");
    let (builder, events, _) = builder(&[(p1.clone(), 0)]);
    let router = builder
        .credentials(Arc::new(provider_router::credentials::StaticCredentials::new()))
        .build()
        .unwrap();

    let outcome = router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;

    assert_eq!(
        outcome,
        RouteOutcome::Failed {
            error: RouteFailure::NoProviderAvailable,
            attempts: 0
        }
    );
    assert_eq!(trail(&events), vec![(Exhaust, 0, None)]);
    assert_eq!(p1.calls(), 0);
    assert_eq!(
        outcome.response().error.map(|e| e.message().to_string()),
        Some(NO_PROVIDER_AVAILABLE.to_string())
    );
}

#[tokio::test]
async fn test_circuit_opens_after_consecutive_failures() {
    let p1 = ScriptedAdapter::failing("p1", NormalizedError::server("upstream 503", Some(503)));
    let h = harness(&[(p1.clone(), 0)]);

    for _ in 0..3 {
        let outcome = h
            .router
            .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
            .await;
        assert!(matches!(outcome, RouteOutcome::Failed { error: RouteFailure::Exhausted(_), .. }));
    }

    let health = h.router.tracker().health_of("p1").await.unwrap();
    assert_eq!(health.circuit_state, CircuitState::Open);
    assert_eq!(health.consecutive_failures, 3);
    assert!(health.cooldown_until_ms > 0);

    let outcome = h
        .router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;
    assert!(matches!(
        outcome,
        RouteOutcome::Failed {
            error: RouteFailure::NoProviderAvailable,
            ..
        }
    ));
    assert_eq!(p1.calls(), 3, "open circuit keeps the provider out of the chain");

    let report = h.router.health_report().await.unwrap();
    assert!(!report[0].available);

    h.router.reset_health("p1").await.unwrap();
    assert_eq!(h.router.preview_chain("c1").await, vec!["p1"]);
}

#[tokio::test]
async fn test_recency_penalty_rotates_within_conversation() {
    let p1 = ScriptedAdapter::replying("p1", "a");
    let p2 = ScriptedAdapter::replying("p2", "b");
    let h = harness(&[(p1, 0), (p2, 0)]);

    // p2 scores 0.95 from a single 500 ms success
    h.router
        .tracker()
        .record_outcome("p2", true, Some(500), None)
        .await
        .unwrap();

    let first = h
        .router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;
    assert_eq!(first.response().provider_id.as_deref(), Some("p1"));

    assert_eq!(h.router.preview_chain("c1").await, vec!["p2", "p1"]);
    assert_eq!(h.router.preview_chain("other").await, vec!["p1", "p2"]);

    let ranked = h.router.rank("c1").await;
    let p1_rank = ranked.iter().find(|r| r.provider_id == "p1").unwrap();
    assert!(p1_rank.recently_used);
    assert!((p1_rank.health_score - p1_rank.effective_score - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_stream_without_terminal_chunk_falls_back() {
    let p1 = ScriptedAdapter::new("p1", vec![Step::Delta("dangling")]);
    let p2 = ScriptedAdapter::replying("p2", "fine");
    let h = harness(&[(p1, 1), (p2, 0)]);

    let outcome = h
        .router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;
    assert_eq!(outcome.response().provider_id.as_deref(), Some("p2"));

    let failure = h
        .events
        .events()
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == Failure)
        .unwrap();
    assert_eq!(failure.error_kind, Some(ErrorKind::Unknown));
    assert_eq!(
        failure.error_message.as_deref(),
        Some(provider_router::drivers::MISSING_TERMINAL)
    );
}

#[tokio::test]
async fn test_failure_before_streaming_records_no_latency() {
    let p1 = ScriptedAdapter::failing("p1", NormalizedError::network("refused"));
    let h = harness(&[(p1, 0)]);
    h.router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;

    let health = h.router.tracker().health_of("p1").await.unwrap();
    assert_eq!(health.failure_count, 1);
    assert_eq!(health.latency_samples, 0);
    let failure = &h.events.events().unwrap()[1];
    assert!(failure.latency_ms.is_some());
}

#[tokio::test]
async fn test_idle_timeout_is_a_network_failure() {
    let p1 = ScriptedAdapter::new("p1", vec![Step::Delta("hello"), Step::Hang]);
    let p2 = ScriptedAdapter::replying("p2", "fine");
    let (builder, events, _) = builder(&[(p1, 1), (p2, 0)]);
    let router = builder
        .attempt_timeout(Some(Duration::from_millis(50)))
        .build()
        .unwrap();

    let outcome = router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;
    assert_eq!(outcome.response().provider_id.as_deref(), Some("p2"));

    let health = router.tracker().health_of("p1").await.unwrap();
    assert_eq!(health.last_error_type, Some(ErrorKind::Network));
    assert_eq!(types(&events), vec![Attempt, Failure, Fallback, Attempt, Success]);
}

struct BrokenStore;

#[async_trait]
impl MessageStore for BrokenStore {
    async fn save_assistant_message(&self, _: AssistantMessage) -> provider_router::Result<String> {
        Err(Error::runtime("disk full"))
    }

    async fn last_assistant_provider(&self, _: &str) -> provider_router::Result<Option<String>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_save_failure_is_reported() {
    let p1 = ScriptedAdapter::replying("p1", "a");
    let (builder, _, _) = builder(&[(p1, 0)]);
    let router = builder.message_store(Arc::new(BrokenStore)).build().unwrap();

    let outcome = router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;
    match outcome {
        RouteOutcome::Failed {
            error: RouteFailure::Persistence(msg),
            attempts,
        } => {
            assert!(msg.contains("disk full"));
            assert_eq!(attempts, 1);
        }
        other => panic!("expected persistence failure, got {:?}", other),
    }
    // the provider itself did its job
    let health = router.tracker().health_of("p1").await.unwrap();
    assert_eq!(health.success_count, 1);
}

struct UnreadableHealth;

#[async_trait]
impl HealthStore for UnreadableHealth {
    async fn get_health(&self, _: &str) -> provider_router::Result<Option<ProviderHealth>> {
        Err(Error::runtime("health backend offline"))
    }

    async fn get_all_health(&self) -> provider_router::Result<Vec<ProviderHealth>> {
        Err(Error::runtime("health backend offline"))
    }

    async fn update_health(
        &self,
        _: &str,
        _: HealthUpdate,
    ) -> provider_router::Result<(ProviderHealth, CircuitChange)> {
        Err(Error::runtime("health backend offline"))
    }

    async fn reset_health(&self, _: &str) -> provider_router::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "unreadable"
    }
}

#[tokio::test]
async fn test_unreadable_health_selects_nothing() {
    let p1 = ScriptedAdapter::replying("p1", "unused");
    let (builder, events, _) = builder(&[(p1.clone(), 0)]);
    let router = builder.health_store(Arc::new(UnreadableHealth)).build().unwrap();

    assert!(router.preview_chain("c1").await.is_empty());
    assert!(router.rank("c1").await.is_empty());

    let outcome = router
        .route_and_save_message("c1", user("hi"), CancellationToken::new(), None)
        .await;
    assert_eq!(
        outcome,
        RouteOutcome::Failed {
            error: RouteFailure::NoProviderAvailable,
            attempts: 0
        }
    );
    assert_eq!(types(&events), vec![Exhaust]);
    assert_eq!(p1.calls(), 0);
}

#[derive(Default)]
struct CountingCredentials {
    lookups: AtomicUsize,
}

impl CredentialProvider for CountingCredentials {
    fn credential(&self, _: &str) -> Option<Credential> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Some(Credential::new("sk-test"))
    }
}

#[tokio::test]
async fn test_cached_credentials_are_read_once_per_provider() {
    let p1 = ScriptedAdapter::failing("p1", NormalizedError::network("reset"));
    let p2 = ScriptedAdapter::replying("p2", "ok");
    let (builder, _, _) = builder(&[(p1, 1), (p2, 0)]);
    let source = Arc::new(CountingCredentials::default());
    let router = builder
        .credentials(Arc::new(
            CachedCredentials::new(source.clone()).preload(["p1", "p2"]),
        ))
        .build()
        .unwrap();

    for conversation in ["a", "b", "c"] {
        let outcome = router
            .route_and_save_message(conversation, user("hi"), CancellationToken::new(), None)
            .await;
        assert!(outcome.is_success());
        router.rank(conversation).await;
    }
    assert_eq!(source.lookups.load(Ordering::SeqCst), 2);

    router.refresh_credential("p2");
    router.preview_chain("d").await;
    assert_eq!(source.lookups.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_conversations_keep_every_outcome() {
    let p1 = ScriptedAdapter::new(
        "p1",
        vec![Step::Sleep(Duration::from_millis(5)), Step::Delta("x"), Step::Done],
    );
    let h = Arc::new(harness(&[(p1.clone(), 0)]));

    let mut handles = Vec::new();
    for i in 0..20 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.router
                .route_and_save_message(&format!("conv-{i}"), user("hi"), CancellationToken::new(), None)
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    let health = h.router.tracker().health_of("p1").await.unwrap();
    assert_eq!(health.success_count, 20);
    assert_eq!(p1.calls(), 20);
    for i in 0..20 {
        assert!(!h.router.is_active(&format!("conv-{i}")));
    }
}
