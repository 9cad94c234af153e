//! OpenAI 兼容适配器：适用于 OpenAI、DeepSeek、Moonshot 等 Chat Completions 接口
//!
//! OpenAI-compatible Chat Completions adapter. Works for any provider that speaks the
//! `/chat/completions` streaming format:
//! - deltas arrive in `choices[0].delta.content`
//! - `choices[0].finish_reason` closes the choice, usage follows in a trailing frame
//!   when `stream_options.include_usage` is set
//! - `data: [DONE]` ends the stream

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::http::{self, error_fields, transport_error};
use super::sse::{self, SseFrame};
use super::{
    terminated, AdapterCapabilities, AdapterSettings, ChunkStream, ConnectionTest,
    ProviderAdapter, StreamTally,
};
use crate::credentials::Credential;
use crate::normalize::{normalize_raw, ErrorKind, NormalizedError, RawProviderError};
use crate::types::chunk::{FinishReason, StreamChunk};
use crate::types::message::ChatRequest;
use crate::utils::elapsed_ms;
use crate::Result;

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleAdapter {
    settings: AdapterSettings,
    client: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        Ok(Self::with_client(settings, http::build_client()?))
    }

    pub fn with_client(settings: AdapterSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    pub(crate) fn build_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let model = request
            .model
            .as_deref()
            .unwrap_or(&self.settings.default_model);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(mt) = request.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        body
    }

    /// One SSE frame in, at most one chunk out. Finish reason and usage go to the tally.
    pub(crate) fn parse_frame(&self, frame: &SseFrame, tally: &mut StreamTally) -> Option<StreamChunk> {
        let v: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(provider_id = %self.settings.provider_id, error = %e, "Skipping non-JSON SSE frame");
                return None;
            }
        };

        if v.get("error").map(|e| !e.is_null()).unwrap_or(false) {
            let (code, message) = error_fields(&frame.data);
            let mut raw = RawProviderError::new(message);
            if let Some(code) = code {
                raw = raw.with_code(code);
            }
            return Some(StreamChunk::error(self.normalize_error(&raw)));
        }

        if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
            tally.prompt_tokens = usage.get("prompt_tokens").and_then(|n| n.as_u64());
            tally.completion_tokens = usage.get("completion_tokens").and_then(|n| n.as_u64());
        }
        if let Some(reason) = v.pointer("/choices/0/finish_reason").and_then(|r| r.as_str()) {
            tally.finish_reason = Some(FinishReason::from_provider(reason));
        }

        v.pointer("/choices/0/delta/content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(StreamChunk::delta)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn provider_id(&self) -> &str {
        &self.settings.provider_id
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.settings.capabilities()
    }

    fn generate(
        &self,
        request: ChatRequest,
        credential: Credential,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let adapter = self.clone();
        let body = self.build_body(&request);

        terminated(Box::pin(async_stream::stream! {
            let send = adapter
                .client
                .post(adapter.settings.url("chat/completions"))
                .bearer_auth(credential.expose())
                .json(&body)
                .send();
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = send => Some(r),
            };
            let response = match sent {
                None => return,
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    yield StreamChunk::error(transport_error(&e));
                    return;
                }
            };
            if !response.status().is_success() {
                let raw = http::raw_error(response).await;
                yield StreamChunk::error(adapter.normalize_error(&raw));
                return;
            }

            let mut frames = sse::decode(response.bytes_stream());
            let mut tally = StreamTally::default();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    f = frames.next() => Some(f),
                };
                match next {
                    None => return,
                    Some(None) => {
                        // some servers close without [DONE] after a finish_reason
                        if tally.finish_reason.is_some() {
                            yield tally.done();
                        }
                        return;
                    }
                    Some(Some(Err(e))) => {
                        yield StreamChunk::error(transport_error(&e));
                        return;
                    }
                    Some(Some(Ok(frame))) => {
                        if frame.is_done() {
                            yield tally.done();
                            return;
                        }
                        if let Some(chunk) = adapter.parse_frame(&frame, &mut tally) {
                            let terminal = chunk.is_terminal();
                            yield chunk;
                            if terminal {
                                return;
                            }
                        }
                    }
                }
            }
        }))
    }

    async fn test_connection(&self, credential: &Credential) -> ConnectionTest {
        let started = Instant::now();
        let result = self
            .client
            .get(self.settings.url("models"))
            .bearer_auth(credential.expose())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                ConnectionTest::ok(elapsed_ms(started))
            }
            Ok(response) => {
                let raw = http::raw_error(response).await;
                ConnectionTest::failed(elapsed_ms(started), self.normalize_error(&raw))
            }
            Err(e) => ConnectionTest::failed(elapsed_ms(started), transport_error(&e)),
        }
    }

    fn normalize_error(&self, raw: &RawProviderError) -> NormalizedError {
        let code = raw.code.as_deref().unwrap_or("");
        let kind = match code {
            "insufficient_quota" | "billing_hard_limit_reached" => Some(ErrorKind::Billing),
            "context_length_exceeded" | "string_above_max_length" => Some(ErrorKind::ContextLength),
            "content_filter" | "content_policy_violation" => Some(ErrorKind::ContentFilter),
            "invalid_api_key" => Some(ErrorKind::Auth),
            _ if raw.status == Some(402) => Some(ErrorKind::Billing),
            _ => None,
        };
        match kind {
            Some(kind) => NormalizedError::of_kind(kind, raw.message.clone()),
            None => normalize_raw(raw),
        }
    }
}
