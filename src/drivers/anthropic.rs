//! Anthropic Messages API 适配器：处理 Anthropic 特有的请求与流式事件格式
//!
//! Anthropic Messages API adapter. Differences from the OpenAI format:
//! - system messages are a top-level `system` parameter, not part of `messages`
//! - `max_tokens` is required
//! - streaming is typed events: `message_start` carries input tokens,
//!   `content_block_delta` carries text, `message_delta` the stop reason and output
//!   tokens, `message_stop` ends the stream, `error` reports in-band failures
//! - overload is HTTP 529 / `overloaded_error`

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
use crate::types::message::{ChatRequest, Message, MessageRole};
use crate::utils::elapsed_ms;
use crate::Result;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    settings: AdapterSettings,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        Ok(Self::with_client(settings, http::build_client()?))
    }

    pub fn with_client(settings: AdapterSettings, client: reqwest::Client) -> Self {
        Self { settings, client }
    }

    /// System prompt joined separately; everything else becomes a turn.
    fn split_system_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut turns: Vec<Value> = Vec::new();

        for m in messages {
            match m.role {
                MessageRole::System => system_parts.push(&m.content),
                MessageRole::User | MessageRole::Assistant => turns.push(json!({
                    "role": m.role.as_str(),
                    "content": [{ "type": "text", "text": m.content }],
                })),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, turns)
    }

    pub(crate) fn build_body(&self, request: &ChatRequest) -> Value {
        let (system, turns) = Self::split_system_messages(&request.messages);
        let model = request
            .model
            .as_deref()
            .unwrap_or(&self.settings.default_model);

        let mut body = json!({
            "model": model,
            "messages": turns,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if let Some(sys) = system {
            body["system"] = Value::String(sys);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }

    pub(crate) fn parse_frame(&self, frame: &SseFrame, tally: &mut StreamTally) -> Option<StreamChunk> {
        let v: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(provider_id = %self.settings.provider_id, error = %e, "Skipping non-JSON SSE frame");
                return None;
            }
        };
        let event_type = v
            .get("type")
            .and_then(|t| t.as_str())
            .or(frame.event.as_deref())
            .unwrap_or("");

        match event_type {
            "message_start" => {
                tally.prompt_tokens = v
                    .pointer("/message/usage/input_tokens")
                    .and_then(|n| n.as_u64());
                None
            }
            "content_block_delta" => v
                .pointer("/delta/text")
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(StreamChunk::delta),
            "message_delta" => {
                if let Some(reason) = v.pointer("/delta/stop_reason").and_then(|r| r.as_str()) {
                    tally.finish_reason = Some(FinishReason::from_provider(reason));
                }
                if let Some(out) = v.pointer("/usage/output_tokens").and_then(|n| n.as_u64()) {
                    tally.completion_tokens = Some(out);
                }
                None
            }
            "message_stop" => Some(tally.done()),
            "error" => {
                let (code, message) = error_fields(&frame.data);
                let mut raw = RawProviderError::new(message);
                if let Some(code) = code {
                    raw = raw.with_code(code);
                }
                Some(StreamChunk::error(self.normalize_error(&raw)))
            }
            // ping, content_block_start, content_block_stop
            _ => None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
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
                .post(adapter.settings.url("messages"))
                .header("x-api-key", credential.expose())
                .header("anthropic-version", ANTHROPIC_VERSION)
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
                    None | Some(None) => return,
                    Some(Some(Err(e))) => {
                        yield StreamChunk::error(transport_error(&e));
                        return;
                    }
                    Some(Some(Ok(frame))) => {
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
            .header("x-api-key", credential.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
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
        let lower = raw.message.to_lowercase();

        if raw.status == Some(529) || code == "overloaded_error" {
            return NormalizedError::server(raw.message.clone(), Some(raw.status.unwrap_or(529)));
        }
        let kind = match code {
            "rate_limit_error" => Some(ErrorKind::RateLimit),
            "authentication_error" | "permission_error" => Some(ErrorKind::Auth),
            "billing_error" => Some(ErrorKind::Billing),
            _ if lower.contains("credit balance") => Some(ErrorKind::Billing),
            _ if lower.contains("prompt is too long") => Some(ErrorKind::ContextLength),
            _ => None,
        };
        match kind {
            Some(kind) => NormalizedError::of_kind(kind, raw.message.clone())
                .with_retry_after_ms(raw.retry_after_ms),
            None => normalize_raw(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::chunk::Usage;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::with_client(
            AdapterSettings::new("anthropic", "https://api.anthropic.com/v1", "claude-3-5-haiku-latest"),
            reqwest::Client::new(),
        )
    }

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_system_message_extraction() {
        let msgs = vec![
            Message::system("You are helpful."),
            Message::user("Hi"),
            Message::assistant("Hello!"),
        ];
        let (sys, turns) = AnthropicAdapter::split_system_messages(&msgs);
        assert_eq!(sys.as_deref(), Some("You are helpful."));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[1]["content"][0]["text"], "Hello!");
    }

    #[test]
    fn test_build_body_defaults_max_tokens() {
        let body = adapter().build_body(&ChatRequest::new(vec![Message::user("Hello")]));
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["model"], "claude-3-5-haiku-latest");
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_event_sequence() {
        let adapter = adapter();
        let mut tally = StreamTally::default();
        assert!(adapter
            .parse_frame(
                &frame("message_start", r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#),
                &mut tally,
            )
            .is_none());
        assert_eq!(
            adapter.parse_frame(
                &frame("content_block_delta", r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#),
                &mut tally,
            ),
            Some(StreamChunk::delta("Hi"))
        );
        assert!(adapter
            .parse_frame(&frame("ping", r#"{"type":"ping"}"#), &mut tally)
            .is_none());
        assert!(adapter
            .parse_frame(
                &frame("message_delta", r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":7}}"#),
                &mut tally,
            )
            .is_none());
        assert_eq!(
            adapter.parse_frame(&frame("message_stop", r#"{"type":"message_stop"}"#), &mut tally),
            Some(StreamChunk::done(Usage::new(12, 7), FinishReason::Length))
        );
    }

    #[test]
    fn test_parse_in_band_overload() {
        let mut tally = StreamTally::default();
        let chunk = adapter().parse_frame(
            &frame("error", r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            &mut tally,
        );
        assert_eq!(
            chunk,
            Some(StreamChunk::error(NormalizedError::server("Overloaded", Some(529))))
        );
    }

    #[test]
    fn test_error_overrides() {
        let adapter = adapter();
        let credit = RawProviderError::new(
            "Your credit balance is too low to access the Anthropic API.",
        )
        .with_status(400)
        .with_code("invalid_request_error");
        assert_eq!(adapter.normalize_error(&credit).kind(), ErrorKind::Billing);

        let long = RawProviderError::new("prompt is too long: 210000 tokens > 200000 maximum")
            .with_status(400)
            .with_code("invalid_request_error");
        assert_eq!(adapter.normalize_error(&long).kind(), ErrorKind::ContextLength);

        let perm = RawProviderError::new("not allowed").with_code("permission_error");
        assert_eq!(adapter.normalize_error(&perm).kind(), ErrorKind::Auth);

        let rate = RawProviderError::new("Number of request tokens has exceeded your per-minute rate limit")
            .with_status(429)
            .with_code("rate_limit_error")
            .with_retry_after_ms(Some(3_000));
        assert_eq!(
            adapter.normalize_error(&rate),
            NormalizedError::RateLimit {
                message: rate.message.clone(),
                retry_after_ms: Some(3_000),
            }
        );
    }
}
