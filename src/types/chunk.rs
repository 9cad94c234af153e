//! Streaming relay protocol between adapters and the orchestrator.
//!
//! An adapter invocation yields a lazy, finite sequence of [`StreamChunk`]s: any number of
//! `Delta`s followed by exactly one terminal chunk (`Error` or `Done`).

use crate::normalize::NormalizedError;
use serde::{Deserialize, Serialize};

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

impl FinishReason {
    /// Maps a provider-native stop reason onto the closed set.
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "length" | "max_tokens" | "model_length" => FinishReason::Length,
            "content_filter" | "safety" | "refusal" => FinishReason::ContentFilter,
            "error" => FinishReason::Error,
            // stop, end_turn, stop_sequence, tool_calls, tool_use
            _ => FinishReason::Stop,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// One item of an adapter's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Incremental text.
    Delta { text: String },
    /// Terminal failure.
    Error { error: NormalizedError },
    /// Terminal success with aggregate usage.
    Done {
        usage: Usage,
        finish_reason: FinishReason,
    },
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        StreamChunk::Delta { text: text.into() }
    }

    pub fn error(error: NormalizedError) -> Self {
        StreamChunk::Error { error }
    }

    pub fn done(usage: Usage, finish_reason: FinishReason) -> Self {
        StreamChunk::Done {
            usage,
            finish_reason,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamChunk::Delta { .. })
    }
}

/// Aggregate of a completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub content: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub latency_ms: u64,
}
