use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, RunId};

/// What the agent needs from the human operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationKind {
    /// Yes/no confirmation before a risky action.
    Confirm,
    /// Free-form text entry (credentials, codes, answers).
    Input,
    /// Pick from a fixed list of options.
    Select { options: Vec<String>, multiple: bool },
    /// Manual takeover of the surface (login, captcha, QR scan).
    RequestHelp { help: HelpType },
}

impl EscalationKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Input => "input",
            Self::Select { .. } => "select",
            Self::RequestHelp { .. } => "request_help",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelpType {
    RequestLogin,
    RequestAssistance,
}

/// A pending hand-off to the human operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub id: String,
    pub run_id: RunId,
    pub agent_id: AgentId,
    pub kind: EscalationKind,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
}

/// The operator's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EscalationResponse {
    Confirmed(bool),
    Text(String),
    Selected(Vec<String>),
    /// Manual takeover finished; `false` means the operator gave up.
    HelpResolved(bool),
}

impl EscalationResponse {
    /// Render the answer as an observation for the oracle.
    pub fn describe(&self) -> String {
        match self {
            Self::Confirmed(true) => "The user confirmed.".to_string(),
            Self::Confirmed(false) => "The user declined.".to_string(),
            Self::Text(text) => format!("The user entered: {}", text),
            Self::Selected(options) => format!("The user selected: {}", options.join(", ")),
            Self::HelpResolved(true) => "The user completed the requested action.".to_string(),
            Self::HelpResolved(false) => {
                "The user could not complete the requested action.".to_string()
            }
        }
    }
}
