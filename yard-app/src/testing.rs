//! Scripted fakes shared by the unit tests.

use crate::failover::BackendFactory;
use crate::usage::{UsageRecord, UsageSink};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use yard_llm::{
    ChatBackend, ChatMessage, ChatOptions, ChatResponse, LlmError, Provider, RateLimitInfo,
    ToolCall, ToolDefinition, Usage,
};

pub type Scripted = Result<ChatResponse, LlmError>;

pub fn text_response(text: &str) -> Scripted {
    Ok(ChatResponse {
        message: ChatMessage::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: None,
        }),
        finish_reason: "stop".to_string(),
    })
}

pub fn tool_response(calls: &[(&str, &str, &str)]) -> Scripted {
    let mut message = ChatMessage::assistant("");
    message.tool_calls = calls
        .iter()
        .map(|(id, name, args)| ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args.to_string(),
        })
        .collect();
    Ok(ChatResponse {
        message,
        usage: None,
        finish_reason: "tool_calls".to_string(),
    })
}

pub fn rate_limited(retry_after: Option<&str>) -> Scripted {
    Err(LlmError::RateLimited(RateLimitInfo {
        status: 429,
        retry_after: retry_after.map(str::to_string),
        ..RateLimitInfo::default()
    }))
}

/// Pops one scripted response per call and records what it was sent.
/// An exhausted script answers "done".
pub struct ScriptedBackend {
    model: String,
    script: Mutex<VecDeque<Scripted>>,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedBackend {
    pub fn new(model: &str, script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        _options: &ChatOptions,
    ) -> yard_llm::Result<ChatResponse> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| text_response("done"))
    }
}

/// Hands out pre-built backends by model name; unknown models fail to build.
#[derive(Default)]
pub struct FakeFactory {
    backends: Mutex<Vec<Arc<ScriptedBackend>>>,
}

impl FakeFactory {
    pub fn with(backends: Vec<Arc<ScriptedBackend>>) -> Arc<Self> {
        Arc::new(Self {
            backends: Mutex::new(backends),
        })
    }
}

impl BackendFactory for FakeFactory {
    fn build(&self, model: &str) -> yard_llm::Result<Arc<dyn ChatBackend>> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.model == model)
            .map(|b| b.clone() as Arc<dyn ChatBackend>)
            .ok_or_else(|| LlmError::Config(format!("no backend for {model}")))
    }
}

#[derive(Default)]
pub struct MemoryUsage {
    pub records: Mutex<Vec<UsageRecord>>,
}

impl UsageSink for MemoryUsage {
    fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
