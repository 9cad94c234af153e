//! Shared HTTP plumbing for the network adapters.

use crate::normalize::{NormalizedError, RawProviderError};
use crate::{Error, ErrorContext, Result};
use reqwest::header::HeaderMap;
use reqwest::Proxy;
use serde_json::Value;
use std::env;
use std::time::Duration;

/// Build the pooled client adapters share.
///
/// Env overrides:
/// - `ROUTER_HTTP_TIMEOUT_SECS` (default 300, covers the whole streamed response)
/// - `ROUTER_HTTP_CONNECT_TIMEOUT_SECS` (default 10)
/// - `ROUTER_HTTP_POOL_MAX_IDLE_PER_HOST` (default 32)
/// - `ROUTER_PROXY_URL`
pub fn build_client() -> Result<reqwest::Client> {
    let timeout_secs = env_u64("ROUTER_HTTP_TIMEOUT_SECS").unwrap_or(300);
    let connect_secs = env_u64("ROUTER_HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(10);

    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(connect_secs))
        .pool_max_idle_per_host(
            env_u64("ROUTER_HTTP_POOL_MAX_IDLE_PER_HOST")
                .map(|n| n as usize)
                .unwrap_or(32),
        )
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .http2_keep_alive_interval(Some(Duration::from_secs(30)))
        .http2_keep_alive_timeout(Duration::from_secs(10));

    if let Ok(proxy_url) = env::var("ROUTER_PROXY_URL") {
        let proxy = Proxy::all(&proxy_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid proxy url: {}", e),
                ErrorContext::new().with_field_path("ROUTER_PROXY_URL"),
            )
        })?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

/// `Retry-After` (seconds) or `retry-after-ms`, in milliseconds.
pub fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
    {
        return Some(ms.max(0.0).round() as u64);
    }
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|secs| (secs.max(0.0) * 1000.0).round() as u64)
}

/// Pull `(code, message)` out of a provider error body.
///
/// Understands `{"error": {"message", "code" | "type"}}` and `{"error": "text"}`.
/// Falls back to the raw body text.
pub fn error_fields(body: &str) -> (Option<String>, String) {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    match error {
        Some(Value::Object(obj)) => {
            let code = obj
                .get("code")
                .and_then(|c| c.as_str())
                .or_else(|| obj.get("type").and_then(|t| t.as_str()))
                .map(String::from);
            let message = obj
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| body.trim().to_string());
            (code, message)
        }
        Some(Value::String(s)) => (None, s.clone()),
        _ => (None, body.trim().to_string()),
    }
}

/// Turn a non-2xx response into a [`RawProviderError`]. Consumes the body.
pub async fn raw_error(response: reqwest::Response) -> RawProviderError {
    let status = response.status();
    let retry_after = retry_after_ms(response.headers());
    let body = response.text().await.unwrap_or_default();
    let (code, message) = error_fields(&body);
    let message = if message.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        message
    };
    let mut raw = RawProviderError::new(message)
        .with_status(status.as_u16())
        .with_retry_after_ms(retry_after);
    if let Some(code) = code {
        raw = raw.with_code(code);
    }
    raw
}

/// Transport-level failures (connect, TLS, timeouts, resets) are network errors.
pub fn transport_error(err: &reqwest::Error) -> NormalizedError {
    if let Some(status) = err.status() {
        return crate::normalize::normalize(&err.to_string(), Some(status.as_u16()));
    }
    NormalizedError::network(err.to_string())
}
