use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolOutput, to_llm_tool_def};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use yard_llm::ToolDefinition;

/// The seam the turn loop executes tool calls through.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// `arguments` is the raw JSON string the model produced.
    async fn execute(&self, name: &str, arguments: &str) -> Result<ToolOutput>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.spec().name;
        if self.by_name.contains_key(&name) {
            return Err(ToolError::InvalidArguments(format!(
                "tool {name} is already registered"
            )));
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.spec().name).collect()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| to_llm_tool_def(t.as_ref())).collect()
    }

    #[tracing::instrument(level = "info", skip_all, fields(tool_name = %name))]
    async fn execute(&self, name: &str, arguments: &str) -> Result<ToolOutput> {
        let Some(tool) = self.by_name.get(name).map(|i| self.tools[*i].clone()) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };
        let args: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(arguments).map_err(|e| {
                ToolError::InvalidArguments(format!("arguments are not valid json: {e}"))
            })?
        };

        let started = Instant::now();
        let out = tool.execute(args).await;
        match &out {
            Ok(v) => tracing::debug!(
                latency_ms = started.elapsed().as_millis() as u64,
                output_len = v.for_model.len(),
                "tool executed"
            ),
            Err(e) => tracing::warn!(
                latency_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "tool execution failed"
            ),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ToolSpec;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "echo back".to_string(),
                parameters_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput> {
            Ok(ToolOutput::text(arguments.to_string()))
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_typed_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("web_search", "{}").await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(ref n) if n == "web_search"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_rejected_before_dispatch() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let err = registry.execute("echo", "{oops").await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let out = registry.execute("echo", "").await.unwrap();
        assert_eq!(out.for_model, "{}");
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        assert!(registry.register(Arc::new(Echo)).is_err());
        assert_eq!(registry.definitions().len(), 1);
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }
}
