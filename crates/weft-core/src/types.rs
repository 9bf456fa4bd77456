use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::traits::{BrowserSurface, HumanChannel, StepTracker};
use crate::variables::VariableStore;

/// Position of an agent inside its workflow plan.
pub type AgentId = usize;

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image { media_type: String, data: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },

    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Bookkeeping the engine attaches to messages it manages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// Never removed by budget pruning.
    #[serde(default)]
    pub protected: bool,
    /// The message carries an environment snapshot.
    #[serde(default)]
    pub snapshot: bool,
    /// Highest compaction policy version already applied (0 = untouched).
    #[serde(default)]
    pub compaction: u32,
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::text(text)],
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: blocks,
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn protected(self) -> Self {
        self.with_metadata(MessageMetadata {
            protected: true,
            ..Default::default()
        })
    }

    pub fn is_protected(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.protected)
    }

    pub fn is_snapshot(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.snapshot)
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool use blocks from this message.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Stop reason from the oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the oracle.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// A chunk of thinking/reasoning content.
    ThinkingDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition for sending to the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// How the execution loop treats a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRole {
    /// Changes the environment; followed by an environment refresh.
    Action,
    /// Moves the viewport without returning content.
    Scroll,
    /// Moves the viewport and returns the page content.
    ScrollExtract,
    /// Returns page content; read-only.
    Extract,
    /// Read-only lookup; no environment refresh.
    Informational,
    /// Hands control to a human operator.
    Escalation,
}

impl ToolRole {
    pub fn refreshes_environment(self) -> bool {
        matches!(
            self,
            Self::Action | Self::Scroll | Self::ScrollExtract | Self::Escalation
        )
    }

    pub fn is_scroll(self) -> bool {
        matches!(self, Self::Scroll | Self::ScrollExtract)
    }

    pub fn extracts_content(self) -> bool {
        matches!(self, Self::Extract | Self::ScrollExtract)
    }
}

/// Context passed to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub agent_id: AgentId,
    pub variables: Arc<VariableStore>,
    pub surface: Option<Arc<dyn BrowserSurface>>,
    pub human: Option<Arc<dyn HumanChannel>>,
    pub steps: Option<Arc<dyn StepTracker>>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(run_id: RunId, agent_id: AgentId, variables: Arc<VariableStore>) -> Self {
        Self {
            run_id,
            agent_id,
            variables,
            surface: None,
            human: None,
            steps: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("run_id", &self.run_id)
            .field("agent_id", &self.agent_id)
            .field("surface", &self.surface.is_some())
            .field("human", &self.human.is_some())
            .field("steps", &self.steps.is_some())
            .finish()
    }
}

/// Completion state of a plan step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Todo,
    Done,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Scheduler status of an agent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// State of one agent execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Assigned,
    Thinking,
    ToolExecuting,
    AwaitingHuman,
    Responding,
    EnvironmentRefresh,
    Completed,
    Failed,
}
