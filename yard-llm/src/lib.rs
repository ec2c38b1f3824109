//! Backend-call layer for Switchyard.
//!
//! Pure HTTP clients behind the [`ChatBackend`] trait. Rate-limit rejections
//! surface as [`LlmError::RateLimited`] with the provider's raw timing hints.

mod anthropic;
mod backend;
mod client;
mod error;
mod openai;
mod provider;
mod types;

pub use backend::{ChatBackend, ChatOptions};
pub use client::{LlmClient, Provider};
pub use error::{LlmError, RateLimitInfo, Result};
pub use provider::infer_provider;
pub use types::{ChatMessage, ChatResponse, Role, ToolCall, ToolDefinition, Usage};
