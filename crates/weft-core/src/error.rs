use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Oracle errors
    #[error("Oracle request failed: {0}")]
    LlmRequest(String),

    #[error("Oracle streaming error: {0}")]
    LlmStream(String),

    #[error("Oracle response parse error: {0}")]
    LlmParse(String),

    #[error("Oracle exchange timed out after {timeout_secs}s")]
    OracleTimeout { timeout_secs: u64 },

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    #[error("Element not found: index {0}")]
    ElementNotFound(usize),

    // Budget errors
    #[error("Agent exceeded max turns ({0})")]
    MaxTurnsExceeded(usize),

    #[error("Agent exceeded max duration ({0}s)")]
    MaxDurationExceeded(u64),

    // Escalation errors
    #[error("Human escalation timed out after {timeout_secs}s: {kind}")]
    EscalationTimeout { kind: String, timeout_secs: u64 },

    #[error("Human escalation channel closed: {0}")]
    EscalationClosed(String),

    // Plan errors
    #[error(transparent)]
    PlanValidation(#[from] PlanValidationError),

    #[error("Plan syntax error at offset {offset}: {message}")]
    PlanSyntax { offset: usize, message: String },

    // Run errors
    #[error("Run cancelled")]
    Cancelled,

    #[error("Interactive surface unavailable: {0}")]
    SurfaceUnavailable(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Propagation class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recoverable: surfaced to the oracle as an observation.
    Tool,
    /// Fatal to the owning agent loop.
    Oracle,
    /// Iteration or time cap reached.
    Budget,
    /// Human wait exceeded its cap or the channel went away.
    Escalation,
    /// Rejected before scheduling.
    Plan,
    Cancelled,
    Internal,
}

impl WeftError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::LlmRequest(_)
            | Self::LlmStream(_)
            | Self::LlmParse(_)
            | Self::OracleTimeout { .. } => ErrorClass::Oracle,
            Self::ToolNotFound(_)
            | Self::ToolExecution { .. }
            | Self::ToolTimeout { .. }
            | Self::ToolValidation(_)
            | Self::ElementNotFound(_) => ErrorClass::Tool,
            Self::MaxTurnsExceeded(_) | Self::MaxDurationExceeded(_) => ErrorClass::Budget,
            Self::EscalationTimeout { .. } | Self::EscalationClosed(_) => ErrorClass::Escalation,
            Self::PlanValidation(_) | Self::PlanSyntax { .. } => ErrorClass::Plan,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::SurfaceUnavailable(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Tool-level errors never unwind past the execution loop.
    pub fn is_tool_level(&self) -> bool {
        self.class() == ErrorClass::Tool
    }
}

/// A plan rejected before scheduling. Always names the offending node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid plan at {node}: {reason}")]
pub struct PlanValidationError {
    pub node: String,
    pub reason: PlanErrorReason,
}

impl PlanValidationError {
    pub fn new(node: impl Into<String>, reason: PlanErrorReason) -> Self {
        Self {
            node: node.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanErrorReason {
    EmptyPlan,
    InvalidId(String),
    DuplicateId(usize),
    UnknownDependency(String),
    ForwardDependency(usize),
    Cycle(Vec<usize>),
    UnknownCapability(String),
    EmptyBody(&'static str),
    UnknownWatchEvent(String),
    EmptyStep,
}

impl fmt::Display for PlanErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPlan => write!(f, "plan declares no agents"),
            Self::InvalidId(id) => write!(f, "agent id `{}` is not a sequence number", id),
            Self::DuplicateId(id) => write!(f, "agent id {} is declared twice", id),
            Self::UnknownDependency(id) => write!(f, "dependsOn references unknown agent `{}`", id),
            Self::ForwardDependency(id) => {
                write!(f, "dependsOn references agent {} which is declared later", id)
            }
            Self::Cycle(path) => {
                let ids: Vec<String> = path.iter().map(|id| id.to_string()).collect();
                write!(f, "dependency cycle {}", ids.join(" -> "))
            }
            Self::UnknownCapability(name) => {
                write!(f, "agent capability `{}` is not registered", name)
            }
            Self::EmptyBody(kind) => write!(f, "{} body contains no steps", kind),
            Self::UnknownWatchEvent(event) => write!(f, "unknown watch event `{}`", event),
            Self::EmptyStep => write!(f, "step has no description"),
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
