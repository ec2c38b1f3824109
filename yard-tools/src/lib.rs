//! Tool-execution layer for Switchyard.
//!
//! Tools are registered into a [`ToolRegistry`] and invoked by the turn loop
//! through the [`ToolExecutor`] trait. File tools are confined to a workspace root.

mod error;
mod exec;
mod filesystem;
mod registry;
mod sleep;
mod traits;

pub use error::{Result, ToolError};
pub use exec::ExecTool;
pub use filesystem::{ListDirTool, ReadFileTool, Workspace, WriteFileTool};
pub use registry::{ToolExecutor, ToolRegistry};
pub use sleep::SleepTool;
pub use traits::{Tool, ToolOutput, ToolSpec, to_llm_tool_def};
