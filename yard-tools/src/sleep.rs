use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolOutput, ToolSpec, require_number};
use async_trait::async_trait;
use std::time::Duration;

const SLEEP_SECONDS_MAX: f64 = 300.0;

/// Explicit wait. Dropping the future (turn cancellation) ends the wait early.
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "sleep".to_string(),
            description: "Wait for a number of seconds before continuing (max 300).".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "seconds": { "type": "number", "minimum": 0, "maximum": SLEEP_SECONDS_MAX }
                },
                "required": ["seconds"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput> {
        let seconds = require_number(&arguments, "seconds")?;
        if !(0.0..=SLEEP_SECONDS_MAX).contains(&seconds) {
            return Err(ToolError::InvalidArguments(format!(
                "seconds must be between 0 and {SLEEP_SECONDS_MAX}"
            )));
        }
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(ToolOutput::text(format!("waited {seconds}s")).silenced())
    }
}
