use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use weft_core::config::{EscalationConfig, EscalationFallback};
use weft_core::error::{Result, WeftError};
use weft_core::human::{EscalationKind, EscalationRequest, HelpType};
use weft_core::traits::Tool;
use weft_core::types::{ToolContext, ToolResult, ToolRole};

pub const HUMAN_INTERACT: &str = "human_interact";

/// Hands control to the human operator and waits for the answer.
pub struct HumanInteractTool {
    config: EscalationConfig,
}

impl HumanInteractTool {
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HumanInput {
    interact_type: String,
    prompt: String,
    #[serde(default)]
    select_options: Vec<String>,
    #[serde(default)]
    select_multiple: bool,
    #[serde(default)]
    help_type: Option<HelpType>,
}

fn parse_kind(input: &HumanInput) -> Result<EscalationKind> {
    match input.interact_type.as_str() {
        "confirm" => Ok(EscalationKind::Confirm),
        "input" => Ok(EscalationKind::Input),
        "select" => {
            if input.select_options.is_empty() {
                return Err(WeftError::ToolValidation(
                    "`selectOptions` is required for select".into(),
                ));
            }
            Ok(EscalationKind::Select {
                options: input.select_options.clone(),
                multiple: input.select_multiple,
            })
        }
        "request_help" => Ok(EscalationKind::RequestHelp {
            help: input.help_type.unwrap_or(HelpType::RequestAssistance),
        }),
        other => Err(WeftError::ToolValidation(format!(
            "unknown interactType `{}`",
            other
        ))),
    }
}

impl Tool for HumanInteractTool {
    fn name(&self) -> &str {
        HUMAN_INTERACT
    }

    fn description(&self) -> &str {
        "Ask the human operator for help. Use `confirm` before risky actions such as \
         payments or deletions, `input` for information only the user knows, `select` to let \
         the user choose, and `request_help` when a login, captcha or verification code \
         blocks progress."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "interactType": {
                    "type": "string",
                    "enum": ["confirm", "input", "select", "request_help"]
                },
                "prompt": {
                    "type": "string",
                    "description": "What to show the user"
                },
                "selectOptions": {
                    "type": "array",
                    "items": { "type": "string" }
                },
                "selectMultiple": { "type": "boolean" },
                "helpType": {
                    "type": "string",
                    "enum": ["request_login", "request_assistance"]
                }
            },
            "required": ["interactType", "prompt"]
        })
    }

    fn role(&self, _input: &Value) -> ToolRole {
        ToolRole::Escalation
    }

    // The wait is bounded by the escalation config, not the registry.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: HumanInput = serde_json::from_value(input)
                .map_err(|e| WeftError::ToolValidation(e.to_string()))?;
            let kind = parse_kind(&params)?;
            let human = ctx.human.clone().ok_or_else(|| WeftError::ToolExecution {
                tool: HUMAN_INTERACT.to_string(),
                message: "no human operator is attached to this run".to_string(),
            })?;

            let request = EscalationRequest {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: ctx.run_id.clone(),
                agent_id: ctx.agent_id,
                kind: kind.clone(),
                prompt: params.prompt,
                timestamp: Utc::now(),
            };
            info!(agent_id = ctx.agent_id, kind = kind.label(), "Escalating to human");

            let wait = human.escalate(request);
            let answer = match self.config.timeout_secs {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), wait).await {
                    Ok(answer) => answer?,
                    Err(_) => {
                        warn!(agent_id = ctx.agent_id, timeout_secs = secs, "Human wait timed out");
                        return match self.config.fallback {
                            EscalationFallback::Decline => Ok(ToolResult::success(format!(
                                "No answer from the user within {}s; treat the request as declined.",
                                secs
                            ))),
                            EscalationFallback::Fail => Err(WeftError::EscalationTimeout {
                                kind: kind.label().to_string(),
                                timeout_secs: secs,
                            }),
                        };
                    }
                },
                None => wait.await?,
            };

            Ok(ToolResult::success(answer.describe()))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use weft_core::human::EscalationResponse;
    use weft_core::variables::VariableStore;
    use weft_core::RunId;
    use weft_test_utils::MockHuman;

    use super::*;

    fn ctx(human: Arc<MockHuman>) -> ToolContext {
        let mut ctx = ToolContext::new(RunId::new(), 1, Arc::new(VariableStore::new()));
        ctx.human = Some(human);
        ctx
    }

    #[tokio::test]
    async fn confirm_round_trip() {
        let human = Arc::new(MockHuman::with_responses(vec![EscalationResponse::Confirmed(
            true,
        )]));
        let tool = HumanInteractTool::new(EscalationConfig::default());
        let result = tool
            .execute(
                json!({"interactType": "confirm", "prompt": "Pay 10 EUR?"}),
                ctx(human.clone()),
            )
            .await
            .unwrap();
        assert_eq!(result.content, "The user confirmed.");
        let requests = human.requests();
        assert_eq!(requests[0].kind, EscalationKind::Confirm);
        assert_eq!(requests[0].agent_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_decline_fallback() {
        let tool = HumanInteractTool::new(EscalationConfig {
            timeout_secs: Some(5),
            fallback: EscalationFallback::Decline,
        });
        let result = tool
            .execute(
                json!({"interactType": "input", "prompt": "Code?"}),
                ctx(Arc::new(MockHuman::absent())),
            )
            .await
            .unwrap();
        assert!(result.content.contains("declined"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_fallback_is_escalation_error() {
        let tool = HumanInteractTool::new(EscalationConfig {
            timeout_secs: Some(5),
            fallback: EscalationFallback::Fail,
        });
        let err = tool
            .execute(
                json!({"interactType": "request_help", "prompt": "Log in", "helpType": "request_login"}),
                ctx(Arc::new(MockHuman::absent())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::EscalationTimeout { .. }));
    }

    #[tokio::test]
    async fn select_requires_options() {
        let tool = HumanInteractTool::new(EscalationConfig::default());
        let err = tool
            .execute(
                json!({"interactType": "select", "prompt": "Pick"}),
                ctx(Arc::new(MockHuman::absent())),
            )
            .await
            .unwrap_err();
        assert!(err.is_tool_level());
    }
}
