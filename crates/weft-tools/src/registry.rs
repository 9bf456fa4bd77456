use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Tool;
use weft_core::types::{ToolContext, ToolDefinition, ToolResult, ToolRole};

/// Registry of the tools one agent may call. Iteration order is by name so
/// the tool list sent to the oracle is stable.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration with the same name replaces the earlier one.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn extend(&mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) {
        for tool in tools {
            self.register_arc(tool);
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for sending to the oracle.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// `(name, description)` pairs shown to the planner. `noPlan` tools are skipped.
    pub fn plan_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .values()
            .filter(|t| !t.no_plan())
            .map(|t| {
                let description = t.plan_description().unwrap_or_else(|| t.description());
                (t.name().to_string(), description.to_string())
            })
            .collect()
    }

    /// How the loop should treat this invocation. Unknown tools count as actions.
    pub fn role_of(&self, name: &str, input: &serde_json::Value) -> ToolRole {
        self.tools
            .get(name)
            .map(|t| t.role(input))
            .unwrap_or(ToolRole::Action)
    }

    pub fn is_idempotent(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.idempotent())
    }

    /// Execute a tool by name under its own timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| WeftError::ToolNotFound(name.to_string()))?;

        debug!(tool = name, agent_id = ctx.agent_id, "Executing tool");

        match tool.timeout_secs() {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), tool.execute(input, ctx))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(WeftError::ToolTimeout {
                        tool: name.to_string(),
                        timeout_secs: secs,
                    }),
                }
            }
            None => tool.execute(input, ctx).await,
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}
