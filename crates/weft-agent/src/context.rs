use chrono::{DateTime, Local};
use serde_json::Value;

use weft_core::types::ChatMessage;
use weft_core::variables::render_value;
use weft_tools::builtin::{HUMAN_INTERACT, TASK_NODE_STATUS, VARIABLE_STORAGE};

use crate::plan::AgentNode;

const HUMAN_SECTION: &str = "# Human interaction\n\
You can hand control to the user with the `human_interact` tool. Use it:\n\
- before irreversible or risky actions such as payments, deletions or sending messages (`confirm`);\n\
- when information only the user knows is required (`input`, `select`);\n\
- when a login, captcha or verification step blocks you (`request_help`).\n\
Do not call it for things you can decide yourself.";

const VARIABLE_SECTION: &str = "# Variables\n\
Steps may carry `input` and `output` variable names. Input values are given to you with the \
step. Your final answer for a step with an `output` is stored under that name for the agents \
that follow. Use the `variable_storage` tool to read or write other shared variables.";

const FOR_EACH_SECTION: &str = "# Repeated steps\n\
A `<forEach items=\"...\">` node repeats its body for every item. You will be given each item \
in turn together with the body step to perform for it.";

const WATCH_SECTION: &str = "# Watched events\n\
A `<watch event=\"...\" loop=\"...\">` node observes the environment. When the event fires you \
will be asked to run its trigger steps; `loop=\"true\"` watches keep observing afterwards.";

/// Assembles the system prompt for one agent.
pub struct AgentPromptBuilder {
    parts: Vec<String>,
}

impl AgentPromptBuilder {
    pub fn new(assistant: &str, capability: &str, description: &str) -> Self {
        Self {
            parts: vec![format!(
                "You are {}, an autonomous AI agent acting as the {} agent.\n\n# Agent description\n{}",
                assistant,
                capability,
                description.trim()
            )],
        }
    }

    /// Add the sections the agent's tools and task tree call for.
    pub fn with_sections(mut self, node: &AgentNode, tool_names: &[String]) -> Self {
        let has_tool = |name: &str| tool_names.iter().any(|t| t == name);
        if has_tool(HUMAN_INTERACT) {
            self.parts.push(HUMAN_SECTION.to_string());
        }
        let has_variables = !node.reads().is_empty() || !node.writes().is_empty();
        if has_variables || has_tool(VARIABLE_STORAGE) {
            self.parts.push(VARIABLE_SECTION.to_string());
        }
        if node.has_for_each() {
            self.parts.push(FOR_EACH_SECTION.to_string());
        }
        if node.has_watch() {
            self.parts.push(WATCH_SECTION.to_string());
        }
        if has_tool(TASK_NODE_STATUS) {
            self.parts.push(
                "Use the `task_node_status` tool to mark steps done as you finish them; steps \
                 already marked done are not repeated."
                    .to_string(),
            );
        }
        self
    }

    /// Current time, the main task and excerpts of upstream results.
    pub fn with_run_context(
        mut self,
        now: DateTime<Local>,
        main_task: &str,
        prior: &[(String, String)],
        excerpt_chars: usize,
    ) -> Self {
        let mut section = format!("Current time: {}", now.format("%Y-%m-%d %H:%M:%S"));
        section.push_str(&format!("\nMain task: {}", main_task.trim()));
        if !prior.is_empty() {
            section.push_str("\n\n# Results of earlier agents");
            for (label, result) in prior {
                section.push_str(&format!("\n## {}\n{}", label, excerpt(result, excerpt_chars)));
            }
        }
        self.parts.push(section);
        self
    }

    pub fn build(self) -> ChatMessage {
        ChatMessage::system(self.parts.join("\n\n---\n\n"))
    }
}

/// First `max_chars` characters, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// User turn that starts work on one step.
pub fn step_prompt(
    label: &str,
    description: &str,
    inputs: &[(String, Option<Value>)],
    item: Option<&Value>,
) -> String {
    let mut prompt = format!("Current step ({}): {}", label, description);
    if let Some(item) = item {
        prompt.push_str(&format!("\nCurrent item: {}", render_value(item)));
    }
    for (name, value) in inputs {
        match value {
            Some(value) => prompt.push_str(&format!(
                "\nInput variable `{}`:\n{}",
                name,
                render_value(value)
            )),
            None => prompt.push_str(&format!("\nInput variable `{}` is not set.", name)),
        }
    }
    prompt.push_str("\nWhen the step is complete, reply with its result and no tool calls.");
    prompt
}

/// User turn asking for a forEach sequence described in prose.
pub fn items_prompt(description: &str) -> String {
    format!(
        "List the items to repeat the next steps for: {}\n\
         Reply with a JSON array only, for example [\"first\", \"second\"].",
        description
    )
}

/// User turn announcing a watch firing.
pub fn watch_prompt(event: &str, description: &str, detail: &str) -> String {
    format!(
        "The watched {} event fired ({}): {}\nRun the trigger steps that follow.",
        event, description, detail
    )
}

/// Text that accompanies an environment snapshot.
pub fn snapshot_text(elements: &str) -> String {
    format!(
        "This is the environment after the last operation: the latest screenshot and the \
         interactive elements. Decide the next operation from it. Do not repeat element \
         indices in your answer.\n\nIndex and elements:\n{}",
        elements
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeZone;
    use serde_json::json;

    use crate::plan::{ForEach, ItemsSource, Step, StepItem};

    use super::*;

    fn node() -> AgentNode {
        AgentNode {
            id: 1,
            capability: "Browser".into(),
            task: "Find prices".into(),
            steps: vec![
                StepItem::Step(Step::new("Open shop").with_output("shop")),
                StepItem::ForEach(ForEach {
                    items: ItemsSource::Literal(vec![json!("a")]),
                    body: vec![StepItem::Step(Step::new("Check"))],
                }),
            ],
            depends_on: BTreeSet::new(),
        }
    }

    #[test]
    fn system_prompt_sections_follow_tools_and_nodes() {
        let now = Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let prompt = AgentPromptBuilder::new("Weft", "Browser", "Drives a browser.")
            .with_sections(&node(), &[HUMAN_INTERACT.to_string()])
            .with_run_context(
                now,
                "Compare prices",
                &[("Collect links".to_string(), "x".repeat(20))],
                5,
            )
            .build()
            .text();
        assert!(prompt.starts_with("You are Weft, an autonomous AI agent acting as the Browser agent."));
        assert!(prompt.contains("# Human interaction"));
        assert!(prompt.contains("# Variables"));
        assert!(prompt.contains("# Repeated steps"));
        assert!(!prompt.contains("# Watched events"));
        assert!(prompt.contains("Current time: 2024-05-01 09:30:00"));
        assert!(prompt.contains("## Collect links\nxxxxx..."));
    }

    #[test]
    fn step_prompt_lists_item_and_inputs() {
        let prompt = step_prompt(
            "2.1",
            "Check price",
            &[("links".into(), Some(json!(["u"]))), ("gone".into(), None)],
            Some(&json!("alpha")),
        );
        assert!(prompt.contains("Current step (2.1): Check price"));
        assert!(prompt.contains("Current item: alpha"));
        assert!(prompt.contains("Input variable `links`:\n[\"u\"]"));
        assert!(prompt.contains("Input variable `gone` is not set."));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo wörld", 4), "héll...");
        assert_eq!(excerpt("short", 10), "short");
    }
}
