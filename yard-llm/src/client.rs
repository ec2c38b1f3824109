use crate::anthropic::AnthropicClient;
use crate::backend::{ChatBackend, ChatOptions};
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse, ToolDefinition};
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    /// Identifier as configured, e.g. `anthropic/claude-sonnet-4-5`.
    model: String,
    /// Identifier sent on the wire, vendor prefix stripped.
    api_model: String,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        let model = model.trim();
        if model.is_empty() {
            return Err(LlmError::Config("model identifier is empty".to_string()));
        }
        if api_key.trim().is_empty() {
            return Err(LlmError::Config(format!("no api key configured for {model}")));
        }
        let (provider, api_model) = detect_provider(model);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            provider,
            api_key: api_key.to_string(),
            model: model.to_string(),
            api_model,
            base_url: None,
            client,
        })
    }

    /// Point OpenAI-compatible traffic at another endpoint (no trailing path).
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
        self
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> Provider {
        self.provider
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<ChatResponse> {
        match self.provider {
            Provider::OpenAI => {
                let c = OpenAiClient::new(
                    self.client.clone(),
                    &self.api_key,
                    &self.api_model,
                    self.base_url.as_deref(),
                );
                let (tools_sanitized, forward, reverse) = sanitize_tools_for_openai(tools);
                let messages_sanitized = sanitize_messages_for_openai(messages, &forward);
                let mut resp = c.chat(&messages_sanitized, &tools_sanitized, options).await?;
                remap_tool_calls_in_response(&mut resp, &reverse);
                Ok(resp)
            }
            Provider::Anthropic => {
                let c = AnthropicClient::new(self.client.clone(), &self.api_key, &self.api_model);
                c.chat(messages, tools, options).await
            }
        }
    }
}

fn detect_provider(model: &str) -> (Provider, String) {
    let m = model.to_ascii_lowercase();
    if m.starts_with("anthropic/") {
        return (Provider::Anthropic, model["anthropic/".len()..].to_string());
    }
    if m.starts_with("openai/") {
        return (Provider::OpenAI, model["openai/".len()..].to_string());
    }
    if m.starts_with("claude-") {
        return (Provider::Anthropic, model.to_string());
    }
    (Provider::OpenAI, model.to_string())
}

fn sanitize_tools_for_openai(
    tools: &[ToolDefinition],
) -> (Vec<ToolDefinition>, HashMap<String, String>, HashMap<String, String>) {
    let mut used: HashMap<String, usize> = HashMap::new();
    let mut forward: HashMap<String, String> = HashMap::new(); // original -> sanitized
    let mut reverse: HashMap<String, String> = HashMap::new(); // sanitized -> original
    let mut out = Vec::with_capacity(tools.len());

    for t in tools {
        let mut name = sanitize_openai_tool_name(&t.name);
        if let Some(n) = used.get_mut(&name) {
            *n += 1;
            name = format!("{name}_{}", *n);
        } else {
            used.insert(name.clone(), 0);
        }
        forward.insert(t.name.clone(), name.clone());
        reverse.insert(name.clone(), t.name.clone());
        out.push(ToolDefinition {
            name,
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        });
    }

    (out, forward, reverse)
}

fn remap_tool_calls_in_response(resp: &mut ChatResponse, reverse: &HashMap<String, String>) {
    for tc in resp.message.tool_calls.iter_mut() {
        if let Some(orig) = reverse.get(&tc.name) {
            tc.name = orig.clone();
        }
    }
}

fn sanitize_messages_for_openai(
    messages: &[ChatMessage],
    forward: &HashMap<String, String>,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        let mut m2 = m.clone();
        for tc in m2.tool_calls.iter_mut() {
            if let Some(s) = forward.get(&tc.name) {
                tc.name = s.clone();
            } else {
                // Best-effort: if tool name isn't in the current tool list, still sanitize to
                // satisfy OpenAI validation.
                tc.name = sanitize_openai_tool_name(&tc.name);
            }
        }
        out.push(m2);
    }
    out
}

fn sanitize_openai_tool_name(name: &str) -> String {
    // OpenAI tool names must match: ^[a-zA-Z0-9_-]+$
    // We preserve readability by replacing invalid characters with underscores.
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "tool".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, Role, ToolCall, ToolDefinition};
    use serde_json::json;

    #[test]
    fn openai_tool_names_are_sanitized_and_unique() {
        let tools = vec![
            ToolDefinition {
                name: "files.read".to_string(),
                description: "read file".to_string(),
                parameters: json!({}),
            },
            ToolDefinition {
                name: "files_read".to_string(),
                description: "read file 2".to_string(),
                parameters: json!({}),
            },
        ];

        let (sanitized, forward, reverse) = sanitize_tools_for_openai(&tools);
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized[0].name.chars().all(|c| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        }));
        assert!(sanitized[1].name.chars().all(|c| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        }));
        assert_ne!(sanitized[0].name, sanitized[1].name);

        let s1 = forward.get("files.read").expect("forward mapping exists");
        let s2 = forward
            .get("files_read")
            .expect("forward mapping exists");
        assert_ne!(s1, s2);
        assert_eq!(
            reverse.get(s1).expect("reverse mapping exists"),
            "files.read"
        );
        assert_eq!(
            reverse.get(s2).expect("reverse mapping exists"),
            "files_read"
        );
    }

    #[test]
    fn openai_messages_tool_calls_are_sanitized_before_send() {
        let tools = vec![ToolDefinition {
            name: "files.read".to_string(),
            description: "read file".to_string(),
            parameters: json!({}),
        }];
        let (_sanitized, forward, _reverse) = sanitize_tools_for_openai(&tools);

        let messages = vec![ChatMessage {
            role: Role::Assistant,
            content: "".to_string(),
            tool_calls: vec![ToolCall {
                id: "tc1".to_string(),
                name: "files.read".to_string(),
                arguments: "{}".to_string(),
            }],
            tool_call_id: None,
        }];

        let sanitized = sanitize_messages_for_openai(&messages, &forward);
        assert_eq!(sanitized.len(), 1);
        assert_eq!(sanitized[0].tool_calls.len(), 1);
        assert_eq!(sanitized[0].tool_calls[0].name, "files_read");
    }

    #[test]
    fn provider_detection_strips_vendor_prefix() {
        assert_eq!(
            detect_provider("anthropic/claude-sonnet-4-5"),
            (Provider::Anthropic, "claude-sonnet-4-5".to_string())
        );
        assert_eq!(
            detect_provider("claude-3-5-haiku-latest"),
            (Provider::Anthropic, "claude-3-5-haiku-latest".to_string())
        );
        assert_eq!(
            detect_provider("openai/gpt-4o-mini"),
            (Provider::OpenAI, "gpt-4o-mini".to_string())
        );
        assert_eq!(
            detect_provider("llama-3.3-70b"),
            (Provider::OpenAI, "llama-3.3-70b".to_string())
        );
    }

    #[test]
    fn client_requires_model_and_key() {
        let err = LlmClient::new("", "gpt-4o").err().expect("missing key rejected");
        assert!(matches!(err, LlmError::Config(_)));

        let err = LlmClient::new("sk-test", "  ").err().expect("empty model rejected");
        assert!(matches!(err, LlmError::Config(_)));

        let client = LlmClient::new("sk-test", "anthropic/claude-sonnet-4-5")
            .expect("client builds");
        assert_eq!(client.model(), "anthropic/claude-sonnet-4-5");
        assert_eq!(client.provider(), Provider::Anthropic);
    }
}
