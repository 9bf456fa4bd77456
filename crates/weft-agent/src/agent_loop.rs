use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::{EngineConfig, ModelConfig};
use weft_core::error::{Result, WeftError};
use weft_core::event::{AgentEvent, EventBus, EventKind};
use weft_core::traits::{BrowserSurface, HumanChannel, LlmClient, StepTracker};
use weft_core::types::*;
use weft_core::surface::SurfaceEvent;
use weft_core::variables::VariableStore;
use weft_llm::{collect_turn, AssembledTurn, StreamAssembler};
use weft_tools::builtin::browser::render_content;
use weft_tools::{Capability, ToolLoadContext, ToolRegistry};

use crate::compaction::{compact_snapshots, compact_tool_output, prune_to_budget};
use crate::context::{self, AgentPromptBuilder};
use crate::extraction::ExtractionPolicy;
use crate::plan::{AgentNode, ItemsSource, StepItem, Watch};
use crate::steps::StepBoard;
use crate::watch::WatchSet;

/// Messages at the end of history that pruning never touches.
const MIN_TAIL: usize = 6;

/// Run-scoped inputs an execution loop receives from the scheduler.
#[derive(Clone)]
pub struct AgentRunContext {
    pub run_id: RunId,
    /// The user's task for the whole workflow.
    pub main_task: String,
    pub variables: Arc<VariableStore>,
    pub event_bus: Arc<EventBus>,
    pub cancel: CancellationToken,
    /// `(label, final answer)` of completed upstream agents.
    pub prior: Vec<(String, String)>,
}

/// Drives one agent node from assignment to completion.
pub struct ExecutionLoop {
    node: AgentNode,
    config: Arc<EngineConfig>,
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    description: String,
    surface: Option<Arc<dyn BrowserSurface>>,
    human: Option<Arc<dyn HumanChannel>>,
    ctx: AgentRunContext,

    messages: Vec<ChatMessage>,
    state: LoopState,
    turns: usize,
    started: Instant,
    malformed_streak: u32,
    extraction: ExtractionPolicy,
    board: Arc<StepBoard>,
    watches: WatchSet,
    last_answer: String,
}

impl ExecutionLoop {
    pub fn new(
        node: AgentNode,
        capability: &Capability,
        llm: Arc<dyn LlmClient>,
        config: Arc<EngineConfig>,
        ctx: AgentRunContext,
    ) -> Self {
        let board = Arc::new(StepBoard::for_node(&node));
        let extraction = ExtractionPolicy::from_config(&config.agent);
        let tools = capability.load_tools(&ToolLoadContext {
            human_available: false,
            escalation: config.escalation.clone(),
        });
        Self {
            node,
            tools,
            description: capability.description().to_string(),
            surface: capability.surface(),
            human: None,
            llm,
            config,
            ctx,
            messages: Vec::new(),
            state: LoopState::Assigned,
            turns: 0,
            started: Instant::now(),
            malformed_streak: 0,
            extraction,
            board,
            watches: WatchSet::new(),
            last_answer: String::new(),
        }
    }

    /// Attach a human channel; this also exposes the `human_interact` tool.
    pub fn with_human(mut self, capability: &Capability, human: Arc<dyn HumanChannel>) -> Self {
        self.tools = capability.load_tools(&ToolLoadContext {
            human_available: true,
            escalation: self.config.escalation.clone(),
        });
        self.human = Some(human);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Run every step. Returns the final answer of the last step.
    pub async fn run(mut self) -> Result<String> {
        let agent_id = self.node.id;
        info!(agent_id, capability = %self.node.capability, steps = self.node.steps.len(), "Agent assigned");
        self.publish_state(LoopState::Assigned);

        let outcome = self.run_steps().await;
        self.watches.clear();

        match outcome {
            Ok(()) => {
                self.set_state(LoopState::Completed);
                info!(agent_id, turns = self.turns, elapsed_ms = self.started.elapsed().as_millis() as u64, "Agent completed");
                Ok(self.last_answer)
            }
            Err(e) => {
                self.set_state(LoopState::Failed);
                error!(agent_id, turns = self.turns, error = %e, "Agent failed");
                Err(e)
            }
        }
    }

    async fn run_steps(&mut self) -> Result<()> {
        let tool_names: Vec<String> = self.tools.list().into_iter().map(str::to_string).collect();
        let system = AgentPromptBuilder::new(
            &self.config.planner.name,
            &self.node.capability,
            &self.description,
        )
        .with_sections(&self.node, &tool_names)
        .with_run_context(
            Local::now(),
            &self.ctx.main_task,
            &self.ctx.prior,
            self.config.agent.prior_result_chars,
        )
        .build();
        self.messages.push(system);

        let board = self.board.clone();
        let root = self
            .node
            .to_markup(&self.ctx.main_task, |i| board.status(i));
        self.messages.push(ChatMessage::user(root).protected());

        if self.node.steps.is_empty() {
            let task = if self.node.task.trim().is_empty() {
                self.ctx.main_task.clone()
            } else {
                self.node.task.clone()
            };
            let prompt = context::step_prompt("0", &task, &[], None);
            self.last_answer = self.answer(prompt).await?;
            return Ok(());
        }

        let steps = self.node.steps.clone();
        for (index, item) in steps.iter().enumerate() {
            self.check_live()?;
            self.fire_ready_watches().await?;
            if self.board.is_done(index) {
                debug!(agent_id = self.node.id, step = index, "Step already done, skipping");
                continue;
            }
            self.run_item(item, index.to_string(), None).await?;
            self.board.mark(&[index], StepStatus::Done);
        }
        self.fire_ready_watches().await?;

        let linger = Duration::from_secs(self.config.agent.watch_linger_secs);
        if !self.watches.is_empty() && !linger.is_zero() {
            debug!(agent_id = self.node.id, linger_secs = linger.as_secs(), "Lingering for watches");
            let deadline = Instant::now() + linger;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || self.watches.is_empty() {
                    break;
                }
                let cancel = self.ctx.cancel.clone();
                let fired = tokio::select! {
                    fired = self.watches.next_within(remaining) => fired,
                    _ = cancel.cancelled() => return Err(WeftError::Cancelled),
                };
                match fired {
                    Some((watch, event)) => self.run_trigger(watch, event).await?,
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn run_item<'a>(
        &'a mut self,
        item: &'a StepItem,
        label: String,
        current: Option<&'a Value>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match item {
                StepItem::Step(step) => {
                    let inputs: Vec<(String, Option<Value>)> = step
                        .input_names()
                        .into_iter()
                        .map(|name| (name.to_string(), self.ctx.variables.get(name)))
                        .collect();
                    let prompt = context::step_prompt(&label, &step.description, &inputs, current);
                    let answer = self.answer(prompt).await?;
                    if let Some(output) = &step.output {
                        let value = output_value(&answer);
                        let version = self.ctx.variables.set(output.trim(), value, Some(self.node.id));
                        debug!(agent_id = self.node.id, variable = %output, version, "Output written");
                    }
                    self.last_answer = answer;
                    Ok(())
                }
                StepItem::ForEach(for_each) => {
                    let items = self.resolve_items(&for_each.items).await?;
                    info!(agent_id = self.node.id, step = %label, items = items.len(), "forEach expanded");
                    for (n, value) in items.iter().enumerate() {
                        self.check_live()?;
                        self.fire_ready_watches().await?;
                        for (k, body) in for_each.body.iter().enumerate() {
                            self.run_item(body, format!("{}.{}.{}", label, n, k), Some(value))
                                .await?;
                        }
                    }
                    Ok(())
                }
                StepItem::Watch(watch) => {
                    match self.surface.clone() {
                        Some(surface) => self.watches.arm(&surface, watch.clone()).await?,
                        None => warn!(
                            agent_id = self.node.id,
                            event = %watch.event,
                            "Watch ignored: agent has no interactive surface"
                        ),
                    }
                    Ok(())
                }
            }
        })
    }

    async fn resolve_items(&mut self, source: &ItemsSource) -> Result<Vec<Value>> {
        match source {
            ItemsSource::Literal(items) => Ok(items.clone()),
            ItemsSource::Variable(name) => match self.ctx.variables.get(name) {
                Some(value) => Ok(items_from_value(value)),
                None => {
                    debug!(agent_id = self.node.id, variable = %name, "forEach variable unset, asking oracle");
                    self.ask_for_items(name).await
                }
            },
            ItemsSource::Described(text) => self.ask_for_items(text).await,
        }
    }

    async fn ask_for_items(&mut self, description: &str) -> Result<Vec<Value>> {
        let answer = self.answer(context::items_prompt(description)).await?;
        parse_item_list(&answer).ok_or_else(|| {
            WeftError::LlmParse(format!(
                "expected a JSON array of forEach items, got: {}",
                context::excerpt(&answer, 200)
            ))
        })
    }

    async fn fire_ready_watches(&mut self) -> Result<()> {
        while let Some((watch, event)) = self.watches.poll_ready() {
            self.run_trigger(watch, event).await?;
        }
        Ok(())
    }

    async fn run_trigger(&mut self, watch: Watch, event: SurfaceEvent) -> Result<()> {
        info!(agent_id = self.node.id, event = %watch.event, detail = %event.detail, "Watch fired");
        self.publish(EventKind::WatchFired {
            event: watch.event,
            detail: event.detail.clone(),
        });
        self.messages.push(ChatMessage::user(context::watch_prompt(
            &watch.event.to_string(),
            &watch.description,
            &event.detail,
        )));
        for (k, item) in watch.trigger.iter().enumerate() {
            self.run_item(item, format!("watch.{}", k), None).await?;
        }
        Ok(())
    }

    /// Put `prompt` to the oracle and converse until it answers. The prompt
    /// is kept out of budget pruning while its step runs.
    async fn answer(&mut self, prompt: String) -> Result<String> {
        self.messages.push(ChatMessage::user(prompt).protected());
        let answer = self.converse().await;
        self.release_prompts();
        answer
    }

    /// Drop the protection of step prompts. The system prompt and the task
    /// markup at the head of history stay protected.
    fn release_prompts(&mut self) {
        for message in self.messages.iter_mut().skip(2) {
            if let Some(metadata) = message.metadata.as_mut() {
                metadata.protected = false;
            }
        }
    }

    /// Exchange with the oracle until it answers without tool calls.
    async fn converse(&mut self) -> Result<String> {
        loop {
            self.check_live()?;
            self.turns += 1;
            if self.turns > self.config.agent.max_turns {
                return Err(WeftError::MaxTurnsExceeded(self.config.agent.max_turns));
            }

            self.set_state(LoopState::Thinking);
            debug!(agent_id = self.node.id, turn = self.turns, "Oracle exchange");
            let timeout_secs = self.config.agent.oracle_timeout_secs;
            let cancel = self.ctx.cancel.clone();
            let assembler = StreamAssembler::with_events(
                self.ctx.event_bus.clone(),
                self.ctx.run_id.clone(),
                Some(self.node.id),
            );
            let pending = exchange(
                self.llm.as_ref(),
                &self.config.model,
                self.messages.clone(),
                self.tools.definitions(),
                assembler,
            );
            let turn = tokio::select! {
                turn = tokio::time::timeout(Duration::from_secs(timeout_secs), pending) => {
                    turn.map_err(|_| WeftError::OracleTimeout { timeout_secs })??
                }
                _ = cancel.cancelled() => return Err(WeftError::Cancelled),
            };
            self.messages.push(turn.to_message());

            if turn.is_final() {
                self.set_state(LoopState::Responding);
                self.malformed_streak = 0;
                return Ok(turn.text);
            }

            if turn.malformed.is_empty() {
                self.malformed_streak = 0;
            } else {
                self.malformed_streak += 1;
                warn!(
                    agent_id = self.node.id,
                    malformed = turn.malformed.len(),
                    streak = self.malformed_streak,
                    "Malformed tool call from oracle"
                );
                if self.malformed_streak > self.config.agent.max_parse_retries {
                    let bad = &turn.malformed[0];
                    return Err(WeftError::LlmParse(format!(
                        "tool call `{}` has invalid arguments: {}",
                        bad.name, bad.error
                    )));
                }
            }

            self.act(&turn).await?;
        }
    }

    /// Execute the turn's tool calls, then refresh the environment and
    /// compact history.
    async fn act(&mut self, turn: &AssembledTurn) -> Result<()> {
        self.set_state(LoopState::ToolExecuting);
        let mut blocks = Vec::with_capacity(turn.tool_calls.len() + turn.malformed.len());
        let mut refresh = false;

        for call in &turn.tool_calls {
            self.publish(EventKind::ToolUse {
                tool_use_id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
            let role = self.tools.role_of(&call.name, &call.input);
            if role == ToolRole::Escalation {
                self.set_state(LoopState::AwaitingHuman);
            }

            let tool_ctx = self.tool_context();
            let cancel = self.ctx.cancel.clone();
            let outcome = tokio::select! {
                outcome = self.tools.execute(&call.name, call.input.clone(), tool_ctx) => outcome,
                _ = cancel.cancelled() => return Err(WeftError::Cancelled),
            };
            if role == ToolRole::Escalation {
                self.set_state(LoopState::ToolExecuting);
            }

            let mut result = match outcome {
                Ok(result) => result,
                Err(e @ WeftError::ToolTimeout { .. }) if !self.tools.is_idempotent(&call.name) => {
                    return Err(e);
                }
                Err(e) if e.is_tool_level() => {
                    warn!(agent_id = self.node.id, tool = %call.name, error = %e, "Tool error returned as observation");
                    ToolResult::error(e.to_string())
                }
                Err(e) => return Err(e),
            };

            if self.extraction.record(role) && !result.is_error {
                if let Some(surface) = self.surface.clone() {
                    if force_extraction(surface.as_ref(), self.node.id, &mut result).await {
                        self.extraction.mark_extracted();
                    }
                }
            }
            refresh |= role.refreshes_environment();

            let content = compact_tool_output(&result.content, self.config.agent.max_tool_output_tokens);
            let result = ToolResult {
                content,
                is_error: result.is_error,
            };
            self.publish(EventKind::ToolResult {
                tool_use_id: call.id.clone(),
                name: call.name.clone(),
                result: result.clone(),
            });
            blocks.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content: result.content,
                is_error: result.is_error,
            });
        }

        for bad in &turn.malformed {
            blocks.push(ContentBlock::ToolResult {
                tool_use_id: bad.id.clone(),
                content: format!(
                    "Invalid arguments for `{}`: {}. Send the call again with a JSON object \
                     matching the tool schema.",
                    bad.name, bad.error
                ),
                is_error: true,
            });
        }

        let mut observation = ChatMessage::tool_results(blocks);
        let refreshed = refresh && self.refresh_environment(&mut observation).await;
        self.messages.push(observation);

        if refreshed {
            compact_snapshots(&mut self.messages, self.config.agent.snapshot_window);
        }
        prune_to_budget(&mut self.messages, self.config.agent.max_context_tokens, MIN_TAIL);
        Ok(())
    }

    /// Append a fresh environment snapshot to `observation`. Returns false
    /// when there is no surface or the capture failed.
    async fn refresh_environment(&mut self, observation: &mut ChatMessage) -> bool {
        let Some(surface) = self.surface.clone() else {
            return false;
        };
        self.set_state(LoopState::EnvironmentRefresh);
        let limit = Duration::from_secs(self.config.agent.snapshot_timeout_secs);
        let snapshot = match tokio::time::timeout(limit, surface.snapshot()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(agent_id = self.node.id, error = %e, "Environment snapshot failed");
                return false;
            }
            Err(_) => {
                warn!(agent_id = self.node.id, timeout_secs = limit.as_secs(), "Environment snapshot timed out");
                return false;
            }
        };

        let has_image = snapshot.screenshot.is_some();
        if let Some(shot) = snapshot.screenshot {
            observation.content.push(ContentBlock::Image {
                media_type: shot.media_type,
                data: shot.data,
            });
        }
        observation
            .content
            .push(ContentBlock::text(context::snapshot_text(&snapshot.elements)));
        observation.metadata = Some(MessageMetadata {
            snapshot: true,
            ..Default::default()
        });
        self.publish(EventKind::Snapshot {
            elements: snapshot.elements.lines().count(),
            has_image,
        });
        true
    }

    fn tool_context(&self) -> ToolContext {
        let mut ctx = ToolContext::new(
            self.ctx.run_id.clone(),
            self.node.id,
            self.ctx.variables.clone(),
        );
        ctx.surface = self.surface.clone();
        ctx.human = self.human.clone();
        ctx.steps = Some(self.board.clone() as Arc<dyn StepTracker>);
        ctx.cancel = self.ctx.cancel.child_token();
        ctx
    }

    fn check_live(&self) -> Result<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(WeftError::Cancelled);
        }
        let limit = self.config.agent.max_duration_secs;
        if self.started.elapsed() > Duration::from_secs(limit) {
            return Err(WeftError::MaxDurationExceeded(limit));
        }
        Ok(())
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            self.publish_state(state);
        }
    }

    fn publish_state(&mut self, state: LoopState) {
        self.state = state;
        self.publish(EventKind::AgentState { state });
    }

    fn publish(&self, kind: EventKind) {
        self.ctx.event_bus.publish(AgentEvent::new(
            self.ctx.run_id.clone(),
            Some(self.node.id),
            kind,
        ));
    }
}

async fn exchange(
    llm: &dyn LlmClient,
    model: &ModelConfig,
    messages: Vec<ChatMessage>,
    definitions: Vec<ToolDefinition>,
    assembler: StreamAssembler,
) -> Result<AssembledTurn> {
    let stream = llm.chat_stream(model, messages, &definitions).await?;
    collect_turn(stream, assembler).await
}

/// Append the page content to a scroll result. Returns false when the
/// surface could not be read.
async fn force_extraction(
    surface: &dyn BrowserSurface,
    agent_id: AgentId,
    result: &mut ToolResult,
) -> bool {
    match surface.extract_content().await {
        Ok(page) => {
            info!(agent_id, "Forced page extraction after repeated scrolling");
            result.content = format!(
                "{}\nCurrent page content extracted:\n{}",
                result.content,
                render_content(&page)
            );
            true
        }
        Err(e) => {
            warn!(agent_id, error = %e, "Forced extraction failed");
            false
        }
    }
}

/// Structured JSON when the answer is an object or array, text otherwise.
fn output_value(answer: &str) -> Value {
    match serde_json::from_str::<Value>(answer.trim()) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => Value::String(answer.trim().to_string()),
    }
}

fn items_from_value(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::String(text) => parse_item_list(&text).unwrap_or_else(|| {
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| Value::String(l.to_string()))
                .collect()
        }),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// The first JSON array in `text`, tolerating prose and code fences.
fn parse_item_list(text: &str) -> Option<Vec<Value>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;
    use weft_test_utils::{MockLlm, MockReply, MockSurface};

    use crate::plan::{ForEach, Step};

    use super::*;

    fn run_ctx(bus: Arc<EventBus>) -> AgentRunContext {
        AgentRunContext {
            run_id: RunId::new(),
            main_task: "Main task".into(),
            variables: Arc::new(VariableStore::new()),
            event_bus: bus,
            cancel: CancellationToken::new(),
            prior: Vec::new(),
        }
    }

    fn node(capability: &str, steps: Vec<StepItem>) -> AgentNode {
        AgentNode {
            id: 0,
            capability: capability.into(),
            task: "Do the thing".into(),
            steps,
            depends_on: BTreeSet::new(),
        }
    }

    fn scroll() -> MockReply {
        MockReply::tool("scroll_mouse_wheel", json!({"amount": 2, "direction": "down"}))
    }

    #[test]
    fn output_values_keep_structure() {
        assert_eq!(output_value(" {\"a\": 1} "), json!({"a": 1}));
        assert_eq!(output_value("[1,2]"), json!([1, 2]));
        assert_eq!(output_value("42"), json!("42"));
        assert_eq!(output_value("plain text"), json!("plain text"));
    }

    #[test]
    fn item_lists_from_prose_and_values() {
        assert_eq!(
            parse_item_list("Sure:\n```json\n[\"a\", \"b\"]\n```"),
            Some(vec![json!("a"), json!("b")])
        );
        assert_eq!(parse_item_list("none"), None);
        assert_eq!(items_from_value(json!("x\n\ny")), vec![json!("x"), json!("y")]);
        assert_eq!(items_from_value(json!({"k": 1})), vec![json!({"k": 1})]);
    }

    #[tokio::test]
    async fn chat_agent_answers_and_writes_output() {
        let llm = Arc::new(MockLlm::with_replies(vec![MockReply::text("{\"total\": 3}")]));
        let bus = Arc::new(EventBus::default());
        let ctx = run_ctx(bus);
        let variables = ctx.variables.clone();
        let plan_node = node("Chat", vec![StepItem::Step(Step::new("Count").with_output("count"))]);

        let answer = ExecutionLoop::new(plan_node, &Capability::chat(), llm.clone(), Arc::default(), ctx)
            .run()
            .await
            .unwrap();
        assert_eq!(answer, "{\"total\": 3}");
        assert_eq!(variables.get("count"), Some(json!({"total": 3})));

        let request = &llm.requests()[0];
        assert!(request.system_text().contains("acting as the Chat agent"));
        assert!(request.last_user_text().contains("Current step (0): Count"));
    }

    #[tokio::test]
    async fn element_not_found_becomes_observation() {
        let surface = Arc::new(MockSurface::new("tab"));
        surface.remove_element(2);
        let llm = Arc::new(MockLlm::with_replies(vec![
            MockReply::tool("click_element", json!({"index": 2})),
            MockReply::text("Button is gone; done."),
        ]));
        let capability = Capability::browser(surface.clone());
        let plan_node = node("Browser", vec![StepItem::Step(Step::new("Click search"))]);

        let answer = ExecutionLoop::new(plan_node, &capability, llm.clone(), Arc::default(), run_ctx(Arc::default()))
            .run()
            .await
            .unwrap();
        assert_eq!(answer, "Button is gone; done.");

        let results = llm.requests()[1].last_tool_results();
        assert_eq!(results.len(), 1);
        assert!(results[0].1);
        assert!(results[0].0.contains("Element not found: index 2"));
    }

    #[tokio::test]
    async fn third_blind_scroll_is_answered_with_page_content() {
        let surface = Arc::new(MockSurface::new("tab").without_screenshots());
        let llm = Arc::new(MockLlm::with_replies(vec![
            scroll(),
            scroll(),
            scroll(),
            MockReply::text("read it"),
        ]));
        let capability = Capability::browser(surface.clone());
        let plan_node = node("Browser", vec![StepItem::Step(Step::new("Read the page"))]);

        ExecutionLoop::new(plan_node, &capability, llm.clone(), Arc::default(), run_ctx(Arc::default()))
            .run()
            .await
            .unwrap();

        let requests = llm.requests();
        let second = requests[2].last_tool_results();
        assert!(!second[0].0.contains("Current page content extracted"));
        let third = requests[3].last_tool_results();
        assert!(third[0].0.contains("Current page content extracted"));
        assert!(third[0].0.contains("page text #1 after 3 scrolls"));
        assert_eq!(surface.extract_count(), 1);
    }

    #[tokio::test]
    async fn failed_scroll_does_not_count_as_extraction() {
        let surface = Arc::new(MockSurface::new("tab").without_screenshots());
        let llm = Arc::new(MockLlm::with_replies(vec![
            scroll(),
            scroll(),
            MockReply::tool("scroll_mouse_wheel", json!({"amount": 2, "direction": "sideways"})),
            scroll(),
            scroll(),
            MockReply::text("read it"),
        ]));
        let capability = Capability::browser(surface.clone());
        let plan_node = node("Browser", vec![StepItem::Step(Step::new("Read the page"))]);

        ExecutionLoop::new(plan_node, &capability, llm.clone(), Arc::default(), run_ctx(Arc::default()))
            .run()
            .await
            .unwrap();

        let requests = llm.requests();
        let failed = requests[3].last_tool_results();
        assert!(failed[0].1);
        assert!(!failed[0].0.contains("Current page content extracted"));
        let next = requests[4].last_tool_results();
        assert!(!next[0].1);
        assert!(next[0].0.contains("page text #1 after 3 scrolls"));
        let after = requests[5].last_tool_results();
        assert!(!after[0].0.contains("Current page content extracted"));
        assert_eq!(surface.extract_count(), 1);
    }

    #[tokio::test]
    async fn tight_budget_keeps_step_prompt_and_tool_pairs() {
        let surface = Arc::new(MockSurface::new("tab"));
        let mut replies: Vec<MockReply> = (0..6)
            .map(|_| MockReply::tool("click_element", json!({"index": 2})))
            .collect();
        replies.push(MockReply::text("clicked"));
        let llm = Arc::new(MockLlm::with_replies(replies));
        let mut config = EngineConfig::default();
        config.agent.max_context_tokens = 1;
        let capability = Capability::browser(surface);
        let plan_node = node("Browser", vec![StepItem::Step(Step::new("Click search repeatedly"))]);

        let agent = ExecutionLoop::new(plan_node, &capability, llm.clone(), Arc::new(config), run_ctx(Arc::default()));
        assert_eq!(agent.run().await.unwrap(), "clicked");

        let requests = llm.requests();
        assert!(requests.last().unwrap().messages.len() < 3 + 2 * 6);
        for request in &requests {
            assert!(request.transcript().contains("Current step (0): Click search repeatedly"));
            let calls: BTreeSet<&str> = request
                .messages
                .iter()
                .flat_map(|m| m.tool_uses())
                .map(|(id, _, _)| id)
                .collect();
            for message in &request.messages {
                for block in &message.content {
                    if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                        assert!(calls.contains(tool_use_id.as_str()), "orphaned result {}", tool_use_id);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn for_each_runs_body_once_per_item_in_order() {
        let llm = Arc::new(MockLlm::from_fn(|req| {
            let last = req.last_user_text();
            MockReply::text(format!("done: {}", last.lines().nth(1).unwrap_or_default()))
        }));
        let plan_node = node(
            "Chat",
            vec![StepItem::ForEach(ForEach {
                items: ItemsSource::Literal(vec![json!("a"), json!("b"), json!("c")]),
                body: vec![StepItem::Step(Step::new("Visit").with_output("last"))],
            })],
        );
        let ctx = run_ctx(Arc::default());
        let variables = ctx.variables.clone();

        ExecutionLoop::new(plan_node, &Capability::chat(), llm.clone(), Arc::default(), ctx)
            .run()
            .await
            .unwrap();

        let items: Vec<String> = llm
            .requests()
            .iter()
            .map(|r| r.last_user_text().lines().nth(1).unwrap_or_default().to_string())
            .collect();
        assert_eq!(items, vec!["Current item: a", "Current item: b", "Current item: c"]);
        assert_eq!(variables.get("last"), Some(json!("done: Current item: c")));
    }

    #[tokio::test]
    async fn described_items_are_resolved_by_oracle() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            MockReply::text("[\"x\", \"y\"]"),
            MockReply::text("one"),
            MockReply::text("two"),
        ]));
        let plan_node = node(
            "Chat",
            vec![StepItem::ForEach(ForEach {
                items: ItemsSource::Described("the two letters".into()),
                body: vec![StepItem::Step(Step::new("Say it"))],
            })],
        );
        let answer = ExecutionLoop::new(plan_node, &Capability::chat(), llm.clone(), Arc::default(), run_ctx(Arc::default()))
            .run()
            .await
            .unwrap();
        assert_eq!(answer, "two");
        assert!(llm.requests()[0].last_user_text().contains("the two letters"));
        assert!(llm.requests()[2].last_user_text().contains("Current item: y"));
    }

    #[tokio::test]
    async fn repeated_malformed_calls_fail_the_loop() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            MockReply::Deltas(vec![
                StreamDelta::ToolUseStart { index: 0, id: "t1".into(), name: "wait".into() },
                StreamDelta::ToolInputDelta { index: 0, delta: "{not json".into() },
            ]),
            MockReply::Deltas(vec![
                StreamDelta::ToolUseStart { index: 0, id: "t2".into(), name: "wait".into() },
                StreamDelta::ToolInputDelta { index: 0, delta: "[1]".into() },
            ]),
        ]));
        let plan_node = node("Chat", vec![StepItem::Step(Step::new("Wait"))]);
        let err = ExecutionLoop::new(plan_node, &Capability::chat(), llm.clone(), Arc::default(), run_ctx(Arc::default()))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::LlmParse(_)));
        // The first malformed call was answered with an error observation.
        let results = llm.requests()[1].last_tool_results();
        assert!(results[0].1);
        assert!(results[0].0.contains("Invalid arguments for `wait`"));
    }

    #[tokio::test]
    async fn oracle_failure_is_fatal() {
        let llm = Arc::new(MockLlm::with_replies(vec![MockReply::Error("503 overloaded".into())]));
        let plan_node = node("Chat", vec![StepItem::Step(Step::new("Talk"))]);
        let err = ExecutionLoop::new(plan_node, &Capability::chat(), llm, Arc::default(), run_ctx(Arc::default()))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.class(), weft_core::ErrorClass::Oracle);
    }

    #[tokio::test]
    async fn turn_budget_is_enforced() {
        let llm = Arc::new(MockLlm::from_fn(|_| MockReply::tool("wait", json!({"duration": 1}))));
        let config = EngineConfig {
            agent: weft_core::config::AgentConfig {
                max_turns: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let surface = Arc::new(MockSurface::new("tab"));
        let plan_node = node("Browser", vec![StepItem::Step(Step::new("Wait forever"))]);
        let err = ExecutionLoop::new(plan_node, &Capability::browser(surface), llm.clone(), Arc::new(config), run_ctx(Arc::default()))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::MaxTurnsExceeded(3)));
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn steps_marked_done_by_the_oracle_are_skipped() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            MockReply::tool("task_node_status", json!({"doneIds": [0, 1]})),
            MockReply::text("did both"),
            MockReply::text("third"),
        ]));
        let plan_node = node(
            "Chat",
            vec![
                StepItem::Step(Step::new("first")),
                StepItem::Step(Step::new("second")),
                StepItem::Step(Step::new("third")),
            ],
        );
        let answer = ExecutionLoop::new(plan_node, &Capability::chat(), llm.clone(), Arc::default(), run_ctx(Arc::default()))
            .run()
            .await
            .unwrap();
        assert_eq!(answer, "third");
        assert_eq!(llm.call_count(), 3);
        assert!(llm.requests()[2].last_user_text().contains("Current step (2): third"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let llm = Arc::new(MockLlm::with_replies(vec![MockReply::Hang]));
        let ctx = run_ctx(Arc::default());
        let cancel = ctx.cancel.clone();
        let plan_node = node("Chat", vec![StepItem::Step(Step::new("Think"))]);
        let handle = tokio::spawn(
            ExecutionLoop::new(plan_node, &Capability::chat(), llm, Arc::default(), ctx).run(),
        );
        tokio::task::yield_now().await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, WeftError::Cancelled));
    }
}
