use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

use weft_core::surface::WatchEvent;
use weft_core::types::{AgentId, StepStatus};

use super::markup::escape;

/// A validated workflow. Built once per run, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowPlan {
    pub name: String,
    pub thought: String,
    pub agents: Vec<AgentNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentNode {
    pub id: AgentId,
    /// Registered capability name.
    pub capability: String,
    pub task: String,
    pub steps: Vec<StepItem>,
    pub depends_on: BTreeSet<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepItem {
    Step(Step),
    ForEach(ForEach),
    Watch(Watch),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub description: String,
    pub input: Option<String>,
    pub output: Option<String>,
}

impl Step {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            input: None,
            output: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Comma-separated input names.
    pub fn input_names(&self) -> Vec<&str> {
        split_names(self.input.as_deref())
    }
}

fn split_names(raw: Option<&str>) -> Vec<&str> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForEach {
    pub items: ItemsSource,
    pub body: Vec<StepItem>,
}

/// Where a forEach gets its sequence from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ItemsSource {
    Literal(Vec<Value>),
    /// Variable Store key holding an array.
    Variable(String),
    /// Free text; the oracle turns it into an array at run time.
    Described(String),
}

impl ItemsSource {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::Literal(Vec::new());
        }
        if raw.starts_with('[') {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
                return Self::Literal(items);
            }
        }
        if raw
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Self::Variable(raw.to_string());
        }
        Self::Described(raw.to_string())
    }

    fn attr(&self) -> String {
        match self {
            Self::Literal(items) => Value::Array(items.clone()).to_string(),
            Self::Variable(name) | Self::Described(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watch {
    pub event: WatchEvent,
    /// Re-arm after each firing.
    pub repeat: bool,
    pub description: String,
    pub trigger: Vec<StepItem>,
}

impl StepItem {
    /// Visit this item and every nested item, depth first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a StepItem)) {
        visit(self);
        let nested = match self {
            Self::Step(_) => return,
            Self::ForEach(f) => &f.body,
            Self::Watch(w) => &w.trigger,
        };
        for item in nested {
            item.walk(visit);
        }
    }

    /// Short human-readable label.
    pub fn summary(&self) -> String {
        match self {
            Self::Step(s) => s.description.clone(),
            Self::ForEach(f) => format!("for each of {}", f.items.attr()),
            Self::Watch(w) => format!("watch {}: {}", w.event, w.description),
        }
    }

    fn render(&self, out: &mut String, indent: usize, top_level: Option<(usize, StepStatus)>) {
        let pad = "  ".repeat(indent);
        let status = top_level
            .map(|(id, status)| format!(" id=\"{}\" status=\"{}\"", id, status))
            .unwrap_or_default();
        match self {
            Self::Step(step) => {
                let mut attrs = status;
                if let Some(input) = &step.input {
                    let _ = write!(attrs, " input=\"{}\"", escape(input));
                }
                if let Some(output) = &step.output {
                    let _ = write!(attrs, " output=\"{}\"", escape(output));
                }
                let _ = writeln!(out, "{}<node{}>{}</node>", pad, attrs, escape(&step.description));
            }
            Self::ForEach(f) => {
                let _ = writeln!(out, "{}<forEach items=\"{}\"{}>", pad, escape(&f.items.attr()), status);
                for item in &f.body {
                    item.render(out, indent + 1, None);
                }
                let _ = writeln!(out, "{}</forEach>", pad);
            }
            Self::Watch(w) => {
                let _ = writeln!(
                    out,
                    "{}<watch event=\"{}\" loop=\"{}\"{}>",
                    pad, w.event, w.repeat, status
                );
                let _ = writeln!(out, "{}  <description>{}</description>", pad, escape(&w.description));
                let _ = writeln!(out, "{}  <trigger>", pad);
                for item in &w.trigger {
                    item.render(out, indent + 2, None);
                }
                let _ = writeln!(out, "{}  </trigger>", pad);
                let _ = writeln!(out, "{}</watch>", pad);
            }
        }
    }
}

impl AgentNode {
    /// Variables this agent reads anywhere in its steps.
    pub fn reads(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for item in &self.steps {
            item.walk(&mut |i| {
                if let StepItem::Step(step) = i {
                    names.extend(step.input_names().into_iter().map(str::to_string));
                }
                if let StepItem::ForEach(ForEach {
                    items: ItemsSource::Variable(name),
                    ..
                }) = i
                {
                    names.insert(name.clone());
                }
            });
        }
        names
    }

    /// Variables this agent writes anywhere in its steps.
    pub fn writes(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for item in &self.steps {
            item.walk(&mut |i| {
                if let StepItem::Step(Step {
                    output: Some(out), ..
                }) = i
                {
                    names.insert(out.trim().to_string());
                }
            });
        }
        names
    }

    pub fn has_watch(&self) -> bool {
        let mut found = false;
        for item in &self.steps {
            item.walk(&mut |i| found |= matches!(i, StepItem::Watch(_)));
        }
        found
    }

    pub fn has_for_each(&self) -> bool {
        let mut found = false;
        for item in &self.steps {
            item.walk(&mut |i| found |= matches!(i, StepItem::ForEach(_)));
        }
        found
    }

    /// The agent's task tree as markup, top-level items tagged with their
    /// index and current status.
    pub fn to_markup(&self, main_task: &str, status: impl Fn(usize) -> StepStatus) -> String {
        let mut out = String::from("<root>\n");
        let _ = writeln!(out, "  <mainTask>{}</mainTask>", escape(main_task));
        let _ = writeln!(out, "  <currentTask>{}</currentTask>", escape(&self.task));
        out.push_str("  <nodes>\n");
        for (i, item) in self.steps.iter().enumerate() {
            item.render(&mut out, 2, Some((i, status(i))));
        }
        out.push_str("  </nodes>\n</root>");
        out
    }
}

/// A data-flow hazard between agents sharing a variable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VariableLint {
    /// Nothing in the plan writes the variable.
    UnboundInput { agent: AgentId, variable: String },
    /// The writer is not upstream of the reader.
    RacyRead {
        agent: AgentId,
        variable: String,
        writer: AgentId,
    },
    /// Two writers that may run at the same time.
    ConcurrentWriters {
        variable: String,
        first: AgentId,
        second: AgentId,
    },
}

impl std::fmt::Display for VariableLint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnboundInput { agent, variable } => write!(
                f,
                "agent {} reads `{}` but no agent writes it",
                agent, variable
            ),
            Self::RacyRead {
                agent,
                variable,
                writer,
            } => write!(
                f,
                "agent {} reads `{}` written by agent {}, which is not upstream",
                agent, variable, writer
            ),
            Self::ConcurrentWriters {
                variable,
                first,
                second,
            } => write!(
                f,
                "agents {} and {} may write `{}` concurrently",
                first, second, variable
            ),
        }
    }
}

impl WorkflowPlan {
    pub fn get(&self, id: AgentId) -> Option<&AgentNode> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Topological layers: every agent appears in the first layer after all
    /// of its dependencies. Ids ascend within a layer.
    pub fn stages(&self) -> Vec<Vec<AgentId>> {
        let mut in_degree: BTreeMap<AgentId, usize> = self
            .agents
            .iter()
            .map(|a| (a.id, a.depends_on.len()))
            .collect();
        let mut layers = Vec::new();
        let mut current: Vec<AgentId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in self.direct_dependents(*id) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(dependent);
                        }
                    }
                }
            }
            layers.push(current);
            current = next.into_iter().collect();
        }
        layers
    }

    fn direct_dependents(&self, id: AgentId) -> impl Iterator<Item = AgentId> + '_ {
        self.agents
            .iter()
            .filter(move |a| a.depends_on.contains(&id))
            .map(|a| a.id)
    }

    /// Transitive dependencies of `id`.
    pub fn ancestors(&self, id: AgentId) -> BTreeSet<AgentId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<AgentId> = self
            .get(id)
            .map(|a| a.depends_on.iter().copied().collect())
            .unwrap_or_default();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                if let Some(agent) = self.get(next) {
                    queue.extend(agent.depends_on.iter().copied());
                }
            }
        }
        seen
    }

    /// Transitive dependents of `id`.
    pub fn dependents(&self, id: AgentId) -> BTreeSet<AgentId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<AgentId> = self.direct_dependents(id).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.direct_dependents(next));
            }
        }
        seen
    }

    pub fn variable_lints(&self) -> Vec<VariableLint> {
        let mut writers: BTreeMap<String, Vec<AgentId>> = BTreeMap::new();
        for agent in &self.agents {
            for name in agent.writes() {
                writers.entry(name).or_default().push(agent.id);
            }
        }

        let mut lints = Vec::new();
        for agent in &self.agents {
            let upstream = self.ancestors(agent.id);
            for variable in agent.reads() {
                match writers.get(&variable) {
                    None => lints.push(VariableLint::UnboundInput {
                        agent: agent.id,
                        variable,
                    }),
                    Some(ids) => {
                        for writer in ids {
                            if *writer != agent.id && !upstream.contains(writer) {
                                lints.push(VariableLint::RacyRead {
                                    agent: agent.id,
                                    variable: variable.clone(),
                                    writer: *writer,
                                });
                            }
                        }
                    }
                }
            }
        }

        for (variable, ids) in &writers {
            for (i, first) in ids.iter().enumerate() {
                for second in &ids[i + 1..] {
                    let ordered = self.ancestors(*second).contains(first)
                        || self.ancestors(*first).contains(second);
                    if !ordered {
                        lints.push(VariableLint::ConcurrentWriters {
                            variable: variable.clone(),
                            first: *first,
                            second: *second,
                        });
                    }
                }
            }
        }
        lints.sort();
        lints
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn agent(id: AgentId, deps: &[AgentId], steps: Vec<StepItem>) -> AgentNode {
        AgentNode {
            id,
            capability: "Chat".into(),
            task: format!("task {}", id),
            steps,
            depends_on: deps.iter().copied().collect(),
        }
    }

    fn diamond() -> WorkflowPlan {
        WorkflowPlan {
            name: "diamond".into(),
            thought: String::new(),
            agents: vec![
                agent(0, &[], vec![StepItem::Step(Step::new("seed").with_output("seed"))]),
                agent(1, &[0], vec![StepItem::Step(Step::new("l").with_input("seed").with_output("out"))]),
                agent(2, &[0], vec![StepItem::Step(Step::new("r").with_input("seed").with_output("out"))]),
                agent(3, &[1, 2], vec![StepItem::Step(Step::new("join").with_input("out, missing"))]),
            ],
        }
    }

    #[test]
    fn items_source_classification() {
        assert_eq!(
            ItemsSource::parse(r#" ["a", 2] "#),
            ItemsSource::Literal(vec![json!("a"), json!(2)])
        );
        assert_eq!(ItemsSource::parse("product_links"), ItemsSource::Variable("product_links".into()));
        assert_eq!(
            ItemsSource::parse("all products on the page"),
            ItemsSource::Described("all products on the page".into())
        );
        assert_eq!(ItemsSource::parse("[broken"), ItemsSource::Described("[broken".into()));
    }

    #[test]
    fn stages_and_closures() {
        let plan = diamond();
        assert_eq!(plan.stages(), vec![vec![0], vec![1, 2], vec![3]]);
        assert_eq!(plan.ancestors(3), BTreeSet::from([0, 1, 2]));
        assert_eq!(plan.dependents(0), BTreeSet::from([1, 2, 3]));
        assert!(plan.dependents(3).is_empty());
    }

    #[test]
    fn lints_report_unbound_and_concurrent_writers() {
        let lints = diamond().variable_lints();
        assert_eq!(
            lints,
            vec![
                VariableLint::UnboundInput {
                    agent: 3,
                    variable: "missing".into()
                },
                VariableLint::ConcurrentWriters {
                    variable: "out".into(),
                    first: 1,
                    second: 2
                },
            ]
        );
    }

    #[test]
    fn racy_read_is_flagged() {
        let plan = WorkflowPlan {
            name: String::new(),
            thought: String::new(),
            agents: vec![
                agent(0, &[], vec![StepItem::Step(Step::new("w").with_output("v"))]),
                agent(1, &[], vec![StepItem::Step(Step::new("r").with_input("v"))]),
            ],
        };
        assert_eq!(
            plan.variable_lints(),
            vec![VariableLint::RacyRead {
                agent: 1,
                variable: "v".into(),
                writer: 0
            }]
        );
    }

    #[test]
    fn markup_carries_top_level_status() {
        let node = agent(
            0,
            &[],
            vec![
                StepItem::Step(Step::new("Open <home>").with_output("page")),
                StepItem::ForEach(ForEach {
                    items: ItemsSource::Variable("links".into()),
                    body: vec![StepItem::Step(Step::new("visit"))],
                }),
            ],
        );
        let text = node.to_markup("Main", |i| if i == 0 { StepStatus::Done } else { StepStatus::Todo });
        assert!(text.contains(r#"<node id="0" status="done" output="page">Open &lt;home&gt;</node>"#));
        assert!(text.contains(r#"<forEach items="links" id="1" status="todo">"#));
        assert!(text.contains("      <node>visit</node>"));
        assert!(node.reads().contains("links"));
        assert!(node.has_for_each());
        assert!(!node.has_watch());
    }
}
