//! 核心类型模块：消息、请求与流式分片。
//!
//! Core data types shared by adapters and the router.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`message`] | Chat messages and the provider-neutral request |
//! | [`chunk`] | Streaming relay protocol chunks and aggregates |

pub mod chunk;
pub mod message;

pub use chunk::{FinishReason, GenerationResult, StreamChunk, Usage};
pub use message::{ChatRequest, Message, MessageRole};
