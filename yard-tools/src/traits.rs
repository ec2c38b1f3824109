use crate::error::{Result, ToolError};
use async_trait::async_trait;
use std::path::PathBuf;

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// What a tool hands back: text for the model, and optionally something for
/// the person on the other end of the chat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub for_model: String,
    pub for_user: Option<String>,
    /// Suppresses `for_user` delivery.
    pub silent: bool,
    pub images: Vec<PathBuf>,
}

impl ToolOutput {
    pub fn text(for_model: impl Into<String>) -> Self {
        Self {
            for_model: for_model.into(),
            ..Self::default()
        }
    }

    pub fn with_user_text(mut self, for_user: impl Into<String>) -> Self {
        self.for_user = Some(for_user.into());
        self
    }

    pub fn silenced(mut self) -> Self {
        self.silent = true;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput>;
}

pub fn to_llm_tool_def(tool: &dyn Tool) -> yard_llm::ToolDefinition {
    let spec = tool.spec();
    yard_llm::ToolDefinition {
        name: spec.name,
        description: spec.description,
        parameters: spec.parameters_schema,
    }
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn require_number(args: &serde_json::Value, key: &str) -> Result<f64> {
    match args.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_f64().ok_or_else(|| {
            ToolError::InvalidArguments(format!("key {key} is not a finite number"))
        }),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "key {key} must be number, got {other:?}"
        ))),
        None => Err(ToolError::InvalidArguments(format!("missing key: {key}"))),
    }
}
