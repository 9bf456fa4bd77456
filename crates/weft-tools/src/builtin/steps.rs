use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};

use weft_core::error::{Result, WeftError};
use weft_core::traits::Tool;
use weft_core::types::{StepStatus, ToolContext, ToolResult, ToolRole};

pub const TASK_NODE_STATUS: &str = "task_node_status";

/// Lets the oracle tick off top-level steps of its own plan.
pub struct TaskNodeStatusTool;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusInput {
    #[serde(default)]
    done_ids: Vec<usize>,
    #[serde(default)]
    todo_ids: Vec<usize>,
}

impl Tool for TaskNodeStatusTool {
    fn name(&self) -> &str {
        TASK_NODE_STATUS
    }

    fn description(&self) -> &str {
        "Update the status of your task steps. Mark steps you have already completed as done \
         so they are not repeated."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "doneIds": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "description": "Step ids that are complete"
                },
                "todoIds": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "description": "Step ids still to do"
                }
            }
        })
    }

    fn no_plan(&self) -> bool {
        true
    }

    fn role(&self, _input: &Value) -> ToolRole {
        ToolRole::Informational
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: StatusInput = serde_json::from_value(input)
                .map_err(|e| WeftError::ToolValidation(e.to_string()))?;
            let tracker = ctx.steps.clone().ok_or_else(|| WeftError::ToolExecution {
                tool: TASK_NODE_STATUS.to_string(),
                message: "this agent has no step list".to_string(),
            })?;

            let mut unknown: Vec<usize> = Vec::new();
            for (ids, status) in [
                (&params.done_ids, StepStatus::Done),
                (&params.todo_ids, StepStatus::Todo),
            ] {
                let known = tracker.mark(ids, status);
                unknown.extend(ids.iter().filter(|id| !known.contains(*id)));
            }

            let mut listing: Vec<String> = tracker
                .steps()
                .into_iter()
                .map(|(id, description, status)| format!("{} [{}] {}", id, status, description))
                .collect();
            if !unknown.is_empty() {
                let ids: Vec<String> = unknown.iter().map(|id| id.to_string()).collect();
                listing.push(format!("Unknown step ids ignored: {}", ids.join(", ")));
            }
            Ok(ToolResult::success(listing.join("\n")))
        })
    }
}
