use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::{AgentEvent, EventBus, EventKind};
use weft_core::traits::LlmClient;
use weft_core::types::{ChatMessage, RunId, StreamDelta};

use crate::plan::{parse_plan, WorkflowPlan};
use crate::registry::CapabilityRegistry;

const PLAN_FORMAT: &str = r#"# Output format
Reply with the plan only, in this markup:
<root>
  <name>short task name</name>
  <thought>your step-by-step reasoning about how to split the task</thought>
  <agents>
    <!-- name: one of the available agents; id: position in this list;
         dependsOn: comma-separated ids of agents that must finish first -->
    <agent name="Agent name" id="0" dependsOn="">
      <task>what this agent must achieve</task>
      <nodes>
        <node>a step</node>
        <node output="variableName">a step whose result is stored for later agents</node>
        <node input="variableName">a step that uses a stored result</node>
        <forEach items="list or variableName">
          <node>a step repeated for every item</node>
        </forEach>
        <watch event="dom" loop="true">
          <description>what to observe</description>
          <trigger>
            <node>a step run whenever the event fires</node>
          </trigger>
        </watch>
      </nodes>
    </agent>
  </agents>
</root>

Independent agents run in parallel; an agent starts only after every agent in its
dependsOn has finished. A conversational agent may omit <task> and <nodes>."#;

/// Turns a task into a validated [`WorkflowPlan`] by asking the oracle.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    config: Arc<EngineConfig>,
    registry: CapabilityRegistry,
    event_bus: Arc<EventBus>,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        config: Arc<EngineConfig>,
        registry: CapabilityRegistry,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            llm,
            config,
            registry,
            event_bus,
        }
    }

    pub fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "You are {}, an autonomous AI agent planner. Understand the user's task and split \
             it into a plan executed by the agents below. Use only the agent names listed.\n\n\
             # Available agents",
            self.config.planner.name
        );
        for (name, factory) in self.registry.iter() {
            prompt.push_str(&format!("\n\n## {}\n{}", name, factory.description().trim()));
            let tools = factory.tools().plan_descriptions();
            if !tools.is_empty() {
                prompt.push_str("\nTools:");
                for (tool, description) in tools {
                    prompt.push_str(&format!("\n- {}: {}", tool, description));
                }
            }
        }
        prompt.push_str("\n\n");
        prompt.push_str(PLAN_FORMAT);
        prompt
    }

    pub async fn plan(&self, task: &str) -> Result<WorkflowPlan> {
        self.plan_for_run(&RunId::new(), task).await
    }

    /// Plan `task`, publishing `Workflow` events for `run_id`. A rejected
    /// plan is sent back with the error, up to `agent.max_parse_retries`
    /// times.
    pub async fn plan_for_run(&self, run_id: &RunId, task: &str) -> Result<WorkflowPlan> {
        let names = self.registry.names();
        let mut messages = vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(task.trim()),
        ];
        let mut attempt = 0;

        loop {
            let text = self.stream_plan(run_id, messages.clone()).await?;
            match parse_plan(&text, &names) {
                Ok(plan) => {
                    info!(run_id = %run_id, name = %plan.name, agents = plan.agents.len(), "Plan accepted");
                    self.publish(
                        run_id,
                        true,
                        EventKind::Workflow {
                            plan: Some(serde_json::to_value(&plan)?),
                            text,
                        },
                    );
                    return Ok(plan);
                }
                Err(e) if attempt < self.config.agent.max_parse_retries => {
                    attempt += 1;
                    warn!(run_id = %run_id, attempt, error = %e, "Plan rejected, asking again");
                    messages.push(ChatMessage::assistant_text(text));
                    messages.push(ChatMessage::user(format!(
                        "The plan was rejected: {}\nReply with the corrected plan only.",
                        e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_plan(&self, run_id: &RunId, messages: Vec<ChatMessage>) -> Result<String> {
        let timeout_secs = self.config.agent.oracle_timeout_secs;
        let exchange = async {
            let mut stream = self
                .llm
                .chat_stream(&self.config.model, messages, &[])
                .await?;
            let mut text = String::new();
            while let Some(delta) = stream.next().await {
                if let StreamDelta::TextDelta(chunk) = delta? {
                    text.push_str(&chunk);
                    self.publish(
                        run_id,
                        false,
                        EventKind::Workflow {
                            text: text.clone(),
                            plan: None,
                        },
                    );
                }
            }
            debug!(run_id = %run_id, chars = text.len(), "Plan streamed");
            Ok::<_, WeftError>(text)
        };
        tokio::time::timeout(Duration::from_secs(timeout_secs), exchange)
            .await
            .map_err(|_| WeftError::OracleTimeout { timeout_secs })?
    }

    fn publish(&self, run_id: &RunId, done: bool, kind: EventKind) {
        let event = if done {
            AgentEvent::new(run_id.clone(), None, kind)
        } else {
            AgentEvent::partial(run_id.clone(), None, kind)
        };
        self.event_bus.publish(event);
    }
}
