//! # provider-router
//!
//! 多厂商 LLM 路由器：基于健康评分选择提供商，熔断不健康的提供商，并在流式生成失败时自动回退。
//!
//! Health-scored router for streaming LLM providers. Every user turn is served by an
//! ordered fallback chain: the healthiest available provider first, then the next,
//! until one finishes its stream, all fail, or the caller cancels.
//!
//! ## Core Ideas
//!
//! - **Normalized failures**: every provider error maps to one closed [`ErrorKind`] set
//! - **Health-driven selection**: success rate and latency feed a score in `[0, 1]`
//! - **Circuit breaking**: repeated failures open a circuit for a cooldown, then one probe
//! - **Streaming-first**: adapters yield deltas and exactly one terminal chunk
//! - **Cancellable**: one token per conversation stops the stream and the chain
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use provider_router::{Message, ProviderRouter, RouterConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> provider_router::Result<()> {
//!     let config = RouterConfig::load("router.yaml")?;
//!     let router = ProviderRouter::builder().from_config(&config)?.build()?;
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let printer = tokio::spawn(async move {
//!         while let Some(event) = rx.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     let outcome = router
//!         .route_and_save_message("conv-1", vec![Message::user("Hi!")], CancellationToken::new(), Some(tx))
//!         .await;
//!     let _ = printer.await;
//!     println!("{}", serde_json::to_string(&outcome.response()).unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`normalize`] | Error taxonomy and provider-error classification |
//! | [`health`] | Health records, scoring and the health store |
//! | [`resilience`] | Circuit state machine and policy |
//! | [`routing`] | Candidate ranking and fallback chain selection |
//! | [`router`] | Fallback orchestration and the call surface |
//! | [`drivers`] | Provider adapters and the streaming relay protocol |
//! | [`registry`] | Provider id to adapter mapping |
//! | [`telemetry`] | Router event log |
//! | [`store`] | Assistant reply persistence boundary |
//! | [`credentials`] | Keyring and environment credentials |
//! | [`config`] | YAML configuration with env overrides |

pub mod config;
pub mod credentials;
pub mod drivers;
pub mod health;
pub mod normalize;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod routing;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use config::RouterConfig;
pub use credentials::{Credential, CredentialProvider};
pub use drivers::{ChunkStream, ProviderAdapter};
pub use health::{HealthTracker, ProviderHealth};
pub use normalize::{ErrorKind, NormalizedError};
pub use router::{ProviderRouter, RelayEvent, RouteFailure, RouteOutcome, RouterBuilder};
pub use routing::{Candidate, CandidateSelector};
pub use telemetry::{EventStore, RouterEvent, RouterEventType};
pub use types::{
    chunk::{FinishReason, StreamChunk, Usage},
    message::{ChatRequest, Message, MessageRole},
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
