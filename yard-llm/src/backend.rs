use crate::client::Provider;
use crate::error::Result;
use crate::types::{ChatMessage, ChatResponse, ToolDefinition};
use async_trait::async_trait;

/// Per-call knobs. `None` leaves the provider default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// One model behind one provider endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn model(&self) -> &str;

    fn provider(&self) -> Provider;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<ChatResponse>;
}
