use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::human::{EscalationRequest, EscalationResponse};
use crate::surface::{
    EnvironmentSnapshot, MouseButton, PageContent, PageInfo, SurfaceEvent, TabInfo, WatchEvent,
};
use crate::types::*;

/// Reasoning oracle: turns a conversation into the next action.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// A capability exposed to the oracle.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in oracle tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Shorter description used when planning.
    fn plan_description(&self) -> Option<&str> {
        None
    }

    /// Hide this tool from the planner.
    fn no_plan(&self) -> bool {
        false
    }

    /// How the loop treats this invocation.
    fn role(&self, input: &serde_json::Value) -> ToolRole {
        let _ = input;
        ToolRole::Action
    }

    /// Whether a timed-out invocation may be reported back and retried.
    fn idempotent(&self) -> bool {
        false
    }

    /// Timeout in seconds for this tool. `None` lets it run until cancelled.
    fn timeout_secs(&self) -> Option<u64> {
        Some(30)
    }
}

/// Browser-like interactive surface driven by one agent at a time.
pub trait BrowserSurface: Send + Sync + 'static {
    /// Identifier of the underlying session; agents sharing it never run concurrently.
    fn surface_id(&self) -> &str;

    fn navigate(&self, url: &str) -> BoxFuture<'_, Result<PageInfo>>;

    fn current_page(&self) -> BoxFuture<'_, Result<PageInfo>>;

    fn go_back(&self) -> BoxFuture<'_, Result<()>>;

    fn click(&self, index: usize, clicks: u32, button: MouseButton) -> BoxFuture<'_, Result<()>>;

    fn input_text(&self, index: usize, text: &str, enter: bool) -> BoxFuture<'_, Result<()>>;

    fn hover(&self, index: usize) -> BoxFuture<'_, Result<()>>;

    /// Scroll by `amount` screens; negative values scroll up.
    fn scroll(&self, amount: i32) -> BoxFuture<'_, Result<()>>;

    fn select_options(&self, index: usize) -> BoxFuture<'_, Result<Vec<String>>>;

    fn select_option(&self, index: usize, option: &str) -> BoxFuture<'_, Result<String>>;

    fn tabs(&self) -> BoxFuture<'_, Result<Vec<TabInfo>>>;

    fn switch_tab(&self, tab_id: u64) -> BoxFuture<'_, Result<TabInfo>>;

    fn extract_content(&self) -> BoxFuture<'_, Result<PageContent>>;

    fn snapshot(&self) -> BoxFuture<'_, Result<EnvironmentSnapshot>>;

    /// Subscribe to an event kind. Dropping the stream deregisters it.
    fn watch(&self, event: WatchEvent) -> BoxFuture<'_, Result<BoxStream<'static, SurfaceEvent>>>;
}

/// Blocking request/response channel to a human operator.
pub trait HumanChannel: Send + Sync + 'static {
    /// Wait for the operator's answer. Dropping the future withdraws the request.
    fn escalate(&self, request: EscalationRequest) -> BoxFuture<'_, Result<EscalationResponse>>;
}

/// Step progress board the oracle can update through `task_node_status`.
pub trait StepTracker: Send + Sync + 'static {
    /// Current `(step index, description, status)` listing.
    fn steps(&self) -> Vec<(usize, String, StepStatus)>;

    /// Set statuses; returns the indices that exist.
    fn mark(&self, indices: &[usize], status: StepStatus) -> Vec<usize>;
}
