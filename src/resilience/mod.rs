//! 弹性模块：按提供商维护熔断状态，隔离持续失败的提供商。
//!
//! # Resilience Module
//!
//! Circuit tracking for providers. The circuit is not a separate object per
//! provider: its state lives on [`ProviderHealth`](crate::health::ProviderHealth)
//! and is advanced by [`CircuitPolicy`] whenever an outcome is recorded.
//!
//! | State | Selectable | Leaves on |
//! |-------|------------|-----------|
//! | **Closed** | yes | `failure_threshold` consecutive failures, or a low score once enough samples exist |
//! | **Open** | no | cooldown expiry (observed as half-open) |
//! | **Half-Open** | yes | next outcome: success closes, failure re-opens with a fresh cooldown |
//!
//! ```rust
//! use provider_router::resilience::CircuitPolicy;
//! use std::time::Duration;
//!
//! let policy = CircuitPolicy::new()
//!     .with_failure_threshold(5)
//!     .with_cooldown(Duration::from_secs(30));
//! assert_eq!(policy.failure_threshold, 5);
//! ```

pub mod circuit_breaker;

pub use circuit_breaker::{is_available, observed_state, CircuitPolicy, CircuitSnapshot, CircuitState};
