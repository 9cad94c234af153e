//! Provider 适配层：通过 trait 统一各厂商的流式生成接口
//!
//! Provider adapter abstraction. Every provider is driven through one capability
//! contract, [`ProviderAdapter`], and dispatched at runtime via `Arc<dyn ProviderAdapter>`.
//!
//! `generate` returns a lazy, finite, non-restartable [`ChunkStream`]: any number of
//! deltas, then exactly one terminal chunk. [`terminated`] enforces that shape for any
//! implementation, and [`collect_generation`] folds a stream into its aggregate result.

pub mod anthropic;
pub mod http;
pub mod openai;
pub mod sse;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::credentials::Credential;
use crate::normalize::{normalize_raw, NormalizedError, RawProviderError};
use crate::types::chunk::{FinishReason, GenerationResult, StreamChunk, Usage};
use crate::types::message::ChatRequest;
use crate::utils::elapsed_ms;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiCompatibleAdapter;

/// Boxed chunk stream returned by every adapter.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send + 'static>>;

/// Static description of what an adapter offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub streaming: bool,
    pub max_context_tokens: Option<u64>,
    pub default_model: String,
    pub models: Vec<String>,
}

/// Where and what an HTTP adapter talks to.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSettings {
    pub provider_id: String,
    pub base_url: String,
    pub default_model: String,
    pub models: Vec<String>,
    pub max_context_tokens: Option<u64>,
}

impl AdapterSettings {
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            base_url: base_url.into(),
            default_model: default_model.into(),
            models: Vec::new(),
            max_context_tokens: None,
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: Option<u64>) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    /// `base_url` joined with `path`, tolerating a trailing slash.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn capabilities(&self) -> AdapterCapabilities {
        let mut models = self.models.clone();
        if !models.iter().any(|m| m == &self.default_model) {
            models.insert(0, self.default_model.clone());
        }
        AdapterCapabilities {
            streaming: true,
            max_context_tokens: self.max_context_tokens,
            default_model: self.default_model.clone(),
            models,
        }
    }
}

/// Result of a minimal credential round trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<NormalizedError>,
}

impl ConnectionTest {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            error: None,
        }
    }

    pub fn failed(latency_ms: u64, error: NormalizedError) -> Self {
        Self {
            success: false,
            latency_ms,
            error: Some(error),
        }
    }
}

/// Core contract for a provider.
///
/// Implementations must stop producing chunks promptly once `cancel` fires and
/// must report failures as a terminal [`StreamChunk::Error`], never by panicking.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    /// Unique provider identifier (matches the configured `id`).
    fn provider_id(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Start one generation.
    fn generate(
        &self,
        request: ChatRequest,
        credential: Credential,
        cancel: CancellationToken,
    ) -> ChunkStream;

    /// Minimal round trip to validate a credential, without a full generation.
    async fn test_connection(&self, credential: &Credential) -> ConnectionTest;

    /// Provider-aware classification. The default is the shared resolution order.
    fn normalize_error(&self, raw: &RawProviderError) -> NormalizedError {
        normalize_raw(raw)
    }
}

/// Message for a stream that ended with no `done` or `error`.
pub const MISSING_TERMINAL: &str = "stream ended without a terminal chunk";

/// Guard an adapter stream so it carries exactly one terminal chunk.
///
/// Nothing is polled from the inner stream after its first terminal chunk. If the
/// inner stream ends without one, an `unknown` error is appended.
pub fn terminated(inner: ChunkStream) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        while let Some(chunk) = inner.next().await {
            let terminal = chunk.is_terminal();
            yield chunk;
            if terminal {
                return;
            }
        }
        yield StreamChunk::error(NormalizedError::unknown(MISSING_TERMINAL));
    })
}

/// Drain a stream into its aggregate result, or the terminal error.
pub async fn collect_generation(
    stream: ChunkStream,
    started: Instant,
) -> Result<GenerationResult, NormalizedError> {
    let mut stream = terminated(stream);
    let mut content = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Delta { text } => content.push_str(&text),
            StreamChunk::Error { error } => return Err(error),
            StreamChunk::Done {
                usage,
                finish_reason,
            } => {
                return Ok(GenerationResult {
                    content,
                    usage,
                    finish_reason,
                    latency_ms: elapsed_ms(started),
                })
            }
        }
    }
    Err(NormalizedError::unknown(MISSING_TERMINAL))
}

/// Usage and finish reason accumulated while parsing a provider stream.
#[derive(Debug, Default)]
pub(crate) struct StreamTally {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub finish_reason: Option<FinishReason>,
}

impl StreamTally {
    pub fn done(&self) -> StreamChunk {
        StreamChunk::done(
            Usage::new(
                self.prompt_tokens.unwrap_or(0),
                self.completion_tokens.unwrap_or(0),
            ),
            self.finish_reason.unwrap_or(FinishReason::Stop),
        )
    }
}
