use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolOutput, ToolSpec, require_string};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

const FILE_BYTES_MAX: usize = 1_000_000;
const LIST_ENTRIES_MAX: usize = 200;

/// Root every file tool is confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root_dir: PathBuf,
}

impl Workspace {
    pub fn new(root_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let root_dir = root_dir.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(ToolError::InvalidArguments(
                "root_dir is required".to_string(),
            ));
        }
        Ok(Arc::new(Self { root_dir }))
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    pub(crate) fn resolve_path(&self, user_path: &str) -> Result<PathBuf> {
        let rel = Path::new(user_path.trim());
        if rel.is_absolute() {
            return Err(ToolError::Unauthorized(
                "absolute paths are not allowed".to_string(),
            ));
        }

        for component in rel.components() {
            match component {
                Component::ParentDir => {
                    return Err(ToolError::Unauthorized(
                        "path traversal is not allowed".to_string(),
                    ));
                }
                Component::CurDir | Component::Normal(_) => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ToolError::Unauthorized("invalid path".to_string()));
                }
            }
        }

        Ok(self.root_dir.join(rel))
    }
}

fn path_schema(extra: Option<(&str, &str)>) -> serde_json::Value {
    let mut properties = serde_json::json!({
        "path": { "type": "string", "description": "Path relative to the workspace root." }
    });
    let mut required = vec!["path"];
    if let Some((key, description)) = extra {
        properties[key] = serde_json::json!({ "type": "string", "description": description });
        required.push(key);
    }
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": properties,
        "required": required,
    })
}

pub struct ReadFileTool {
    workspace: Arc<Workspace>,
}

impl ReadFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read a UTF-8 text file from the workspace.".to_string(),
            parameters_schema: path_schema(None),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput> {
        let path = require_string(&arguments, "path")?;
        let resolved = self.workspace.resolve_path(&path)?;
        let bytes = tokio::fs::read(&resolved).await?;
        if bytes.len() > FILE_BYTES_MAX {
            return Err(ToolError::ExecutionFailed(format!(
                "file too large: {} bytes (max {FILE_BYTES_MAX})",
                bytes.len()
            )));
        }
        Ok(ToolOutput::text(String::from_utf8_lossy(&bytes).to_string()))
    }
}

pub struct WriteFileTool {
    workspace: Arc<Workspace>,
}

impl WriteFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".to_string(),
            description: "Create or overwrite a text file in the workspace.".to_string(),
            parameters_schema: path_schema(Some(("content", "Full file content."))),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput> {
        let path = require_string(&arguments, "path")?;
        let content = require_string(&arguments, "content")?;
        let resolved = self.workspace.resolve_path(&path)?;
        if content.len() > FILE_BYTES_MAX {
            return Err(ToolError::ExecutionFailed(format!(
                "content too large: {} bytes (max {FILE_BYTES_MAX})",
                content.len()
            )));
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, &content).await?;
        Ok(ToolOutput::text(format!(
            "wrote {} bytes to {path}",
            content.len()
        )))
    }
}

pub struct ListDirTool {
    workspace: Arc<Workspace>,
}

impl ListDirTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_dir".to_string(),
            description: "List entries of a workspace directory. Directories end with '/'."
                .to_string(),
            parameters_schema: path_schema(None),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput> {
        let path = require_string(&arguments, "path")?;
        let resolved = self.workspace.resolve_path(&path)?;
        let mut out = Vec::new();
        let mut truncated = false;
        let mut rd = tokio::fs::read_dir(&resolved).await?;
        while let Some(entry) = rd.next_entry().await? {
            if out.len() >= LIST_ENTRIES_MAX {
                truncated = true;
                break;
            }
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            out.push(name);
        }
        out.sort();
        let mut text = if out.is_empty() {
            "(empty directory)".to_string()
        } else {
            out.join("\n")
        };
        if truncated {
            text.push_str(&format!("\n...[truncated at {LIST_ENTRIES_MAX} entries]"));
        }
        Ok(ToolOutput::text(text))
    }
}
