use serde::Serialize;

use crate::human::{EscalationRequest, EscalationResponse};
use crate::surface::WatchEvent;
use crate::types::{AgentId, LoopState, NodeStatus, RunId, ToolResult};

/// One engine event. Consumers that only care about final state skip
/// events with `stream_done == false`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    pub run_id: RunId,
    /// Emitting agent; `None` for run-level events.
    pub agent: Option<AgentId>,
    pub stream_done: bool,
    pub kind: EventKind,
}

impl AgentEvent {
    pub fn new(run_id: RunId, agent: Option<AgentId>, kind: EventKind) -> Self {
        Self {
            run_id,
            agent,
            stream_done: true,
            kind,
        }
    }

    pub fn partial(run_id: RunId, agent: Option<AgentId>, kind: EventKind) -> Self {
        Self {
            run_id,
            agent,
            stream_done: false,
            kind,
        }
    }

    /// Wire name of the event kind.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EventKind::Workflow { .. } => "workflow",
            EventKind::Text { .. } => "text",
            EventKind::Thinking { .. } => "thinking",
            EventKind::ToolStreaming { .. } => "tool_streaming",
            EventKind::ToolUse { .. } => "tool_use",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::AgentState { .. } => "agent_state",
            EventKind::NodeStatus { .. } => "node_status",
            EventKind::Snapshot { .. } => "snapshot",
            EventKind::WatchFired { .. } => "watch_fired",
            EventKind::EscalationRequested { .. } => "escalation_requested",
            EventKind::EscalationResolved { .. } => "escalation_resolved",
            EventKind::RunFinished { .. } => "run_finished",
            EventKind::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Planner output. Partial events carry the raw text so far; the final
    /// one carries the parsed plan.
    Workflow {
        text: String,
        plan: Option<serde_json::Value>,
    },
    /// Accumulated assistant text for the current exchange.
    Text { text: String },
    Thinking { text: String },
    /// Partial tool arguments as they stream in.
    ToolStreaming {
        tool_use_id: String,
        name: String,
        partial_input: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        result: ToolResult,
    },
    AgentState { state: LoopState },
    NodeStatus {
        status: NodeStatus,
        detail: Option<String>,
    },
    Snapshot { elements: usize, has_image: bool },
    WatchFired { event: WatchEvent, detail: String },
    EscalationRequested { request: EscalationRequest },
    EscalationResolved {
        request_id: String,
        response: Option<EscalationResponse>,
    },
    RunFinished { success: bool, summary: String },
    Error { message: String },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: AgentEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}
