use crate::error::{Result, ToolError};
use crate::filesystem::Workspace;
use crate::traits::{Tool, ToolOutput, ToolSpec, optional_string, require_string};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

pub struct ExecTool {
    workspace: Arc<Workspace>,
    timeout: Duration,
    output_max_chars: usize,
}

impl ExecTool {
    pub fn new(workspace: Arc<Workspace>, timeout: Duration, output_max_chars: usize) -> Self {
        Self {
            workspace,
            timeout,
            output_max_chars: output_max_chars.max(1),
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "exec".to_string(),
            description: "Run a shell command inside the workspace and return its combined output."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "command": { "type": "string" },
                    "working_dir": { "type": "string", "description": "Relative to the workspace root." }
                },
                "required": ["command"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput> {
        let command = require_string(&arguments, "command")?;
        if command.trim().is_empty() {
            return Err(ToolError::InvalidArguments("command is empty".to_string()));
        }
        let working_dir = match optional_string(&arguments, "working_dir")? {
            Some(dir) => self.workspace.resolve_path(&dir)?,
            None => self.workspace.root().to_path_buf(),
        };
        tokio::fs::create_dir_all(&working_dir).await?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ToolError::ExecutionFailed(format!(
                    "command timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("STDERR:\n");
            text.push_str(&stderr);
        }
        if let Some(code) = output.status.code().filter(|c| *c != 0) {
            text.push_str(&format!("\nExit code: {code}"));
        }
        if text.trim().is_empty() {
            text = "(no output)".to_string();
        }
        Ok(ToolOutput::text(truncate_chars(&text, self.output_max_chars)))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n...[truncated, {} more chars]", total - max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(root: &std::path::Path, timeout: Duration) -> ExecTool {
        ExecTool::new(Workspace::new(root).unwrap(), timeout, 10_000)
    }

    #[tokio::test]
    async fn exec_echo_works() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tool(tmp.path(), Duration::from_secs(5))
            .execute(serde_json::json!({ "command": "echo hello" }))
            .await
            .unwrap();
        assert!(out.for_model.contains("hello"));
        assert!(!out.for_model.contains("Exit code"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tool(tmp.path(), Duration::from_secs(5))
            .execute(serde_json::json!({ "command": "echo oops >&2; exit 3" }))
            .await
            .unwrap();
        assert!(out.for_model.contains("STDERR:"));
        assert!(out.for_model.contains("Exit code: 3"));
    }

    #[tokio::test]
    async fn exec_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let err = tool(tmp.path(), Duration::from_millis(100))
            .execute(serde_json::json!({ "command": "sleep 5" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn working_dir_cannot_escape_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let err = tool(tmp.path(), Duration::from_secs(5))
            .execute(serde_json::json!({ "command": "pwd", "working_dir": "../outside" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path traversal"));
    }

    #[test]
    fn truncation_marks_dropped_chars() {
        let out = truncate_chars("abcdefghij", 4);
        assert!(out.starts_with("abcd\n"));
        assert!(out.contains("6 more chars"));
        assert_eq!(truncate_chars("abc", 4), "abc");
    }
}
