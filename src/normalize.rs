//! 错误归一化：将各提供商的失败统一归类为封闭的错误分类。
//!
//! Error normalization: classifies arbitrary provider failures into a closed taxonomy.
//!
//! Every adapter failure (HTTP status, in-band stream error, transport fault) is reduced to
//! one of eight [`ErrorKind`]s. The rest of the router only ever looks at the kind.
//!
//! ## Resolution order
//!
//! | Step | Input | Result |
//! |------|-------|--------|
//! | 1 | status 429 | `rate_limit` |
//! | 1 | status 401 / 403 | `auth` |
//! | 1 | status >= 500 | `server_error` |
//! | 2a | network transport keywords | `network` |
//! | 2b | rate / quota keywords | `rate_limit` |
//! | 2c | invalid key / unauthorized keywords | `auth` |
//! | 2d | context / token keywords | `context_length` |
//! | 2e | content / safety keywords | `content_filter` |
//! | 2f | anything else | `unknown` |
//!
//! Rate-limit keywords are checked before auth keywords: quota messages frequently mention
//! the API "key" and would otherwise be misread as credential failures.
//!
//! ```rust
//! use provider_router::normalize::{normalize, ErrorKind};
//!
//! let err = normalize("Rate limit exceeded, please check your key", None);
//! assert_eq!(err.kind(), ErrorKind::RateLimit);
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of failure classes the router reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Billing,
    ContextLength,
    ContentFilter,
    ServerError,
    Network,
    Unknown,
}

impl ErrorKind {
    /// Returns the wire name (e.g., `"rate_limit"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Billing => "billing",
            Self::ContextLength => "context_length",
            Self::ContentFilter => "content_filter",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a wire name back into a kind.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "rate_limit" => Self::RateLimit,
            "auth" => Self::Auth,
            "billing" => Self::Billing,
            "context_length" => Self::ContextLength,
            "content_filter" => Self::ContentFilter,
            "server_error" => Self::ServerError,
            "network" => Self::Network,
            "unknown" => Self::Unknown,
            _ => return None,
        };
        Some(kind)
    }

    /// Transient kinds are expected to clear up on their own.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ServerError | Self::Network | Self::Unknown
        )
    }

    /// Provider-specific failures that usually need the user to fix credentials or billing.
    #[inline]
    pub fn requires_user_action(&self) -> bool {
        matches!(self, Self::Auth | Self::Billing)
    }

    /// Failures caused by the shape of the request rather than the provider's health.
    #[inline]
    pub fn is_request_shape(&self) -> bool {
        matches!(self, Self::ContextLength | Self::ContentFilter)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A classified provider failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedError {
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("billing problem: {message}")]
    Billing { message: String },

    #[error("context length exceeded (max {max_tokens} tokens): {message}")]
    ContextLength {
        message: String,
        /// Largest context the provider reported; 0 when it did not say.
        max_tokens: u64,
    },

    #[error("content filtered: {message}")]
    ContentFilter { message: String },

    #[error("server error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    ServerError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl NormalizedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Billing { .. } => ErrorKind::Billing,
            Self::ContextLength { .. } => ErrorKind::ContextLength,
            Self::ContentFilter { .. } => ErrorKind::ContentFilter,
            Self::ServerError { .. } => ErrorKind::ServerError,
            Self::Network { .. } => ErrorKind::Network,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::RateLimit { message, .. }
            | Self::Auth { message }
            | Self::Billing { message }
            | Self::ContextLength { message, .. }
            | Self::ContentFilter { message }
            | Self::ServerError { message, .. }
            | Self::Network { message }
            | Self::Unknown { message } => message,
        }
    }

    /// Builds an error of the given kind, filling hints from the message where possible.
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::RateLimit => Self::RateLimit {
                retry_after_ms: retry_after_hint(&message),
                message,
            },
            ErrorKind::Auth => Self::Auth { message },
            ErrorKind::Billing => Self::Billing { message },
            ErrorKind::ContextLength => Self::ContextLength {
                max_tokens: max_tokens_hint(&message).unwrap_or(0),
                message,
            },
            ErrorKind::ContentFilter => Self::ContentFilter { message },
            ErrorKind::ServerError => Self::ServerError {
                message,
                status: None,
            },
            ErrorKind::Network => Self::Network { message },
            ErrorKind::Unknown => Self::Unknown { message },
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::ServerError {
            message: message.into(),
            status,
        }
    }

    /// Attaches a retry hint to a rate-limit error; other kinds are returned unchanged.
    pub fn with_retry_after_ms(self, hint: Option<u64>) -> Self {
        match self {
            Self::RateLimit {
                message,
                retry_after_ms,
            } => Self::RateLimit {
                message,
                retry_after_ms: hint.or(retry_after_ms),
            },
            other => other,
        }
    }
}

/// A raw failure as an adapter observed it, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawProviderError {
    /// HTTP status, if the failure came with one.
    pub status: Option<u16>,
    /// Provider-native error code or type (e.g., `"insufficient_quota"`, `"overloaded_error"`).
    pub code: Option<String>,
    pub message: String,
    /// `Retry-After` in milliseconds, if the provider sent one.
    pub retry_after_ms: Option<u64>,
}

impl RawProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retry_after_ms(mut self, ms: Option<u64>) -> Self {
        self.retry_after_ms = ms;
        self
    }
}

const NETWORK_KEYWORDS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "etimedout",
    "enotfound",
    "eai_again",
    "socket hang up",
    "fetch failed",
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "dns error",
    "network",
    "timed out",
    "timeout",
];

const RATE_KEYWORDS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota",
    "requests per min",
    "tokens per min",
    "resource_exhausted",
    "resource exhausted",
];

const AUTH_KEYWORDS: &[&str] = &[
    "invalid api key",
    "invalid_api_key",
    "incorrect api key",
    "invalid x-api-key",
    "invalid key",
    "api key not valid",
    "unauthorized",
    "unauthenticated",
    "authentication",
    "permission denied",
    "forbidden",
];

const CONTEXT_KEYWORDS: &[&str] = &[
    "context length",
    "context_length",
    "context window",
    "maximum context",
    "too many tokens",
    "prompt is too long",
    "input is too long",
    "max_tokens",
    "token limit",
    "tokens",
];

const CONTENT_KEYWORDS: &[&str] = &[
    "content filter",
    "content_filter",
    "content policy",
    "content management policy",
    "safety",
    "moderation",
    "flagged",
    "blocked",
];

static RETRY_AFTER_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?:retry|try again)\s+(?:after|in)\s+(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?")
        .ok()
});

static MAX_TOKENS_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?:maximum context length|context window|maximum|max(?:imum)?\s+tokens?)\D{0,24}(\d{3,})").ok()
});

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Extracts a "retry after N seconds" hint from free text, in milliseconds.
pub fn retry_after_hint(message: &str) -> Option<u64> {
    let re = RETRY_AFTER_RE.as_ref()?;
    let lower = message.to_lowercase();
    let caps = re.captures(&lower)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let is_ms = caps
        .get(2)
        .map(|u| u.as_str().starts_with("ms") || u.as_str().starts_with("milli"))
        .unwrap_or(false);
    let ms = if is_ms { value } else { value * 1000.0 };
    Some(ms.round() as u64)
}

/// Extracts the provider's maximum context size from free text.
pub fn max_tokens_hint(message: &str) -> Option<u64> {
    let re = MAX_TOKENS_RE.as_ref()?;
    let lower = message.to_lowercase();
    re.captures(&lower)?.get(1)?.as_str().parse().ok()
}

/// Step 1: explicit status codes.
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        429 => Some(ErrorKind::RateLimit),
        401 | 403 => Some(ErrorKind::Auth),
        s if s >= 500 => Some(ErrorKind::ServerError),
        _ => None,
    }
}

/// Step 2: keyword matching over the lower-cased message, in fixed priority.
pub fn classify_message(message: &str) -> ErrorKind {
    let m = message.to_lowercase();
    if contains_any(&m, NETWORK_KEYWORDS) {
        return ErrorKind::Network;
    }
    if contains_any(&m, RATE_KEYWORDS) {
        return ErrorKind::RateLimit;
    }
    if contains_any(&m, AUTH_KEYWORDS) {
        return ErrorKind::Auth;
    }
    if contains_any(&m, CONTEXT_KEYWORDS) {
        return ErrorKind::ContextLength;
    }
    if contains_any(&m, CONTENT_KEYWORDS) {
        return ErrorKind::ContentFilter;
    }
    ErrorKind::Unknown
}

/// Classifies a failure from its message and optional HTTP status.
pub fn normalize(message: &str, status: Option<u16>) -> NormalizedError {
    if let Some(status) = status {
        if let Some(kind) = classify_status(status) {
            return match NormalizedError::of_kind(kind, message) {
                NormalizedError::ServerError { message, .. } => NormalizedError::ServerError {
                    message,
                    status: Some(status),
                },
                other => other,
            };
        }
    }
    NormalizedError::of_kind(classify_message(message), message)
}

/// Shared fallback for adapters: classifies a [`RawProviderError`] ignoring its provider code.
pub fn normalize_raw(raw: &RawProviderError) -> NormalizedError {
    normalize(&raw.message, raw.status).with_retry_after_ms(raw.retry_after_ms)
}
