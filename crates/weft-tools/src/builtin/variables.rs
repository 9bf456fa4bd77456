use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Tool;
use weft_core::types::{ToolContext, ToolResult, ToolRole};
use weft_core::variables::render_value;

pub const VARIABLE_STORAGE: &str = "variable_storage";

/// Read and write the run's shared variables.
pub struct VariableStorageTool;

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Operation {
    ReadVariable,
    WriteVariable,
    ListAllVariable,
}

#[derive(Deserialize)]
struct VariableInput {
    operation: Operation,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

impl Tool for VariableStorageTool {
    fn name(&self) -> &str {
        VARIABLE_STORAGE
    }

    fn description(&self) -> &str {
        "Read, write or list the variables shared by every agent in this workflow. \
         `read_variable` accepts several comma-separated names."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["read_variable", "write_variable", "list_all_variable"]
                },
                "name": {
                    "type": "string",
                    "description": "Variable name; comma-separated names when reading"
                },
                "value": {
                    "description": "Value to store when writing"
                }
            },
            "required": ["operation"]
        })
    }

    fn role(&self, _input: &Value) -> ToolRole {
        ToolRole::Informational
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: VariableInput = serde_json::from_value(input)
                .map_err(|e| WeftError::ToolValidation(e.to_string()))?;
            let vars = &ctx.variables;

            match params.operation {
                Operation::ReadVariable => {
                    let names = params
                        .name
                        .ok_or_else(|| WeftError::ToolValidation("`name` is required".into()))?;
                    let mut found = Map::new();
                    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                        let value = vars.get(name).unwrap_or(Value::Null);
                        found.insert(name.to_string(), value);
                    }
                    if found.len() == 1 {
                        let value = found.into_iter().next().map(|(_, v)| v).unwrap_or_default();
                        return Ok(match value {
                            Value::Null => ToolResult::success("(not set)"),
                            other => ToolResult::success(render_value(&other)),
                        });
                    }
                    Ok(ToolResult::success(Value::Object(found).to_string()))
                }
                Operation::WriteVariable => {
                    let name = params
                        .name
                        .filter(|n| !n.trim().is_empty())
                        .ok_or_else(|| WeftError::ToolValidation("`name` is required".into()))?;
                    let value = params
                        .value
                        .ok_or_else(|| WeftError::ToolValidation("`value` is required".into()))?;
                    debug!(agent_id = ctx.agent_id, variable = %name, "Writing variable");
                    vars.set(name.trim(), value, Some(ctx.agent_id));
                    Ok(ToolResult::success(format!("Stored `{}`.", name.trim())))
                }
                Operation::ListAllVariable => {
                    let keys = vars.keys();
                    if keys.is_empty() {
                        Ok(ToolResult::success("(no variables)"))
                    } else {
                        Ok(ToolResult::success(keys.join(", ")))
                    }
                }
            }
        })
    }
}
