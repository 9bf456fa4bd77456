use std::collections::{BTreeMap, BTreeSet};

use weft_core::error::{PlanErrorReason, PlanValidationError, Result};
use weft_core::surface::WatchEvent;
use weft_core::types::AgentId;

use super::document::{AgentDocument, ItemsDocument, NodeDocument, PlanDocument};
use super::markup::parse_any;
use super::model::{AgentNode, ForEach, ItemsSource, Step, StepItem, Watch, WorkflowPlan};

type Validation<T> = std::result::Result<T, PlanValidationError>;

/// Parse plan text (markup or JSON) and validate it.
pub fn parse_plan<S: AsRef<str>>(text: &str, capabilities: &[S]) -> Result<WorkflowPlan> {
    let document = parse_any(text)?;
    Ok(validate(&document, capabilities)?)
}

/// Turn a plan document into a [`WorkflowPlan`], rejecting empty plans,
/// bad or duplicate ids, unknown, forward or cyclic dependencies, unknown
/// capabilities and empty bodies.
pub fn validate<S: AsRef<str>>(
    doc: &PlanDocument,
    capabilities: &[S],
) -> Validation<WorkflowPlan> {
    if doc.agents.is_empty() {
        return Err(PlanValidationError::new("plan", PlanErrorReason::EmptyPlan));
    }

    // Ids, in declaration order.
    let mut ids: Vec<AgentId> = Vec::with_capacity(doc.agents.len());
    let mut position: BTreeMap<AgentId, usize> = BTreeMap::new();
    for (index, agent) in doc.agents.iter().enumerate() {
        let raw = agent.id.raw();
        let id: AgentId = raw.parse().map_err(|_| {
            PlanValidationError::new(
                format!("agent #{} ({})", index, agent.name),
                PlanErrorReason::InvalidId(raw.clone()),
            )
        })?;
        if position.insert(id, index).is_some() {
            return Err(PlanValidationError::new(
                label(id),
                PlanErrorReason::DuplicateId(id),
            ));
        }
        ids.push(id);
    }

    let mut edges: BTreeMap<AgentId, BTreeSet<AgentId>> = BTreeMap::new();
    for (agent, id) in doc.agents.iter().zip(&ids) {
        let mut deps = BTreeSet::new();
        for raw in agent.depends_on.refs() {
            let dep = raw
                .parse::<AgentId>()
                .ok()
                .filter(|dep| position.contains_key(dep))
                .ok_or_else(|| {
                    PlanValidationError::new(label(*id), PlanErrorReason::UnknownDependency(raw))
                })?;
            deps.insert(dep);
        }
        edges.insert(*id, deps);
    }

    if let Some(cycle) = find_cycle(&edges) {
        let at = cycle.first().copied().unwrap_or_default();
        return Err(PlanValidationError::new(
            label(at),
            PlanErrorReason::Cycle(cycle),
        ));
    }

    for id in &ids {
        let own = position[id];
        if let Some(dep) = edges[id].iter().find(|dep| position[*dep] > own) {
            return Err(PlanValidationError::new(
                label(*id),
                PlanErrorReason::ForwardDependency(*dep),
            ));
        }
    }

    let mut agents = Vec::with_capacity(doc.agents.len());
    for (agent, id) in doc.agents.iter().zip(&ids) {
        let capability = capabilities
            .iter()
            .map(AsRef::as_ref)
            .find(|name| name.eq_ignore_ascii_case(agent.name.trim()))
            .ok_or_else(|| {
                PlanValidationError::new(
                    label(*id),
                    PlanErrorReason::UnknownCapability(agent.name.clone()),
                )
            })?;
        agents.push(build_agent(agent, *id, capability, edges[id].clone())?);
    }

    Ok(WorkflowPlan {
        name: doc.name.trim().to_string(),
        thought: doc.thought.trim().to_string(),
        agents,
    })
}

fn label(id: AgentId) -> String {
    format!("agent {}", id)
}

fn build_agent(
    doc: &AgentDocument,
    id: AgentId,
    capability: &str,
    depends_on: BTreeSet<AgentId>,
) -> Validation<AgentNode> {
    let steps = build_items(&doc.nodes, &label(id))?;
    Ok(AgentNode {
        id,
        capability: capability.to_string(),
        task: doc.task.clone().unwrap_or_default(),
        steps,
        depends_on,
    })
}

fn build_items(nodes: &[NodeDocument], path: &str) -> Validation<Vec<StepItem>> {
    nodes
        .iter()
        .enumerate()
        .map(|(index, node)| build_item(node, path, index))
        .collect()
}

fn build_item(node: &NodeDocument, parent: &str, index: usize) -> Validation<StepItem> {
    match node {
        NodeDocument::Node {
            text,
            input,
            output,
        } => {
            let path = format!("{} / node #{}", parent, index);
            let description = text.trim();
            if description.is_empty() {
                return Err(PlanValidationError::new(path, PlanErrorReason::EmptyStep));
            }
            Ok(StepItem::Step(Step {
                description: description.to_string(),
                input: clean(input),
                output: clean(output),
            }))
        }
        NodeDocument::ForEach { items, nodes } => {
            let path = format!("{} / forEach #{}", parent, index);
            if nodes.is_empty() {
                return Err(PlanValidationError::new(
                    path,
                    PlanErrorReason::EmptyBody("forEach"),
                ));
            }
            let items = match items {
                ItemsDocument::List(values) => ItemsSource::Literal(values.clone()),
                ItemsDocument::Text(raw) => ItemsSource::parse(raw),
            };
            Ok(StepItem::ForEach(ForEach {
                items,
                body: build_items(nodes, &path)?,
            }))
        }
        NodeDocument::Watch {
            event,
            repeat,
            description,
            trigger,
        } => {
            let path = format!("{} / watch #{}", parent, index);
            let event: WatchEvent = event.parse().map_err(|bad: String| {
                PlanValidationError::new(path.clone(), PlanErrorReason::UnknownWatchEvent(bad))
            })?;
            if trigger.is_empty() {
                return Err(PlanValidationError::new(
                    path,
                    PlanErrorReason::EmptyBody("watch"),
                ));
            }
            Ok(StepItem::Watch(Watch {
                event,
                repeat: repeat.is_true(),
                description: description.trim().to_string(),
                trigger: build_items(trigger, &path)?,
            }))
        }
    }
}

fn clean(name: &Option<String>) -> Option<String> {
    name.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

/// First dependency cycle found, as a closed path.
fn find_cycle(edges: &BTreeMap<AgentId, BTreeSet<AgentId>>) -> Option<Vec<AgentId>> {
    let mut states = BTreeMap::new();
    let mut stack = Vec::new();
    for id in edges.keys() {
        if states.contains_key(id) {
            continue;
        }
        if let Some(path) = visit(*id, edges, &mut states, &mut stack) {
            return Some(path);
        }
    }
    None
}

fn visit(
    id: AgentId,
    edges: &BTreeMap<AgentId, BTreeSet<AgentId>>,
    states: &mut BTreeMap<AgentId, VisitState>,
    stack: &mut Vec<AgentId>,
) -> Option<Vec<AgentId>> {
    states.insert(id, VisitState::Visiting);
    stack.push(id);

    for next in edges.get(&id).into_iter().flatten() {
        match states.get(next) {
            Some(VisitState::Visiting) => {
                let start = stack.iter().position(|entry| entry == next).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(*next);
                return Some(cycle);
            }
            Some(VisitState::Visited) => {}
            None => {
                if let Some(path) = visit(*next, edges, states, stack) {
                    return Some(path);
                }
            }
        }
    }

    stack.pop();
    states.insert(id, VisitState::Visited);
    None
}
