use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{ErrorClass, Result, WeftError};
use weft_core::event::{AgentEvent, EventBus, EventKind};
use weft_core::types::{AgentId, NodeStatus, RunId};
use weft_core::variables::VariableStore;

use crate::agent_loop::AgentRunContext;
use crate::context::excerpt;
use crate::plan::WorkflowPlan;
use crate::registry::CapabilityRegistry;

/// Why a node did not reach `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Error,
    /// Turn or time budget exhausted.
    Budget,
    Cancelled,
}

impl FailureKind {
    fn of(e: &WeftError) -> Self {
        match e.class() {
            ErrorClass::Budget => Self::Budget,
            ErrorClass::Cancelled => Self::Cancelled,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: AgentId,
    pub capability: String,
    pub status: NodeStatus,
    pub output: Option<String>,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
    pub elapsed_ms: Option<u64>,
}

/// Outcome of a whole run. Outputs of completed branches are kept even
/// when other branches failed.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub success: bool,
    pub summary: String,
    pub reports: BTreeMap<AgentId, NodeReport>,
    pub variables: BTreeMap<String, Value>,
}

impl WorkflowResult {
    pub fn report(&self, id: AgentId) -> Option<&NodeReport> {
        self.reports.get(&id)
    }

    pub fn status(&self, id: AgentId) -> Option<NodeStatus> {
        self.reports.get(&id).map(|r| r.status)
    }

    pub fn output(&self, id: AgentId) -> Option<&str> {
        self.reports.get(&id).and_then(|r| r.output.as_deref())
    }
}

/// Runs validated plans: one concurrent execution loop per ready agent,
/// launched in ascending id order.
pub struct Scheduler {
    registry: CapabilityRegistry,
    config: Arc<EngineConfig>,
    event_bus: Arc<EventBus>,
}

impl Scheduler {
    pub fn new(registry: CapabilityRegistry, config: Arc<EngineConfig>, event_bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            config,
            event_bus,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Start a run in the background.
    pub fn start(
        &self,
        plan: WorkflowPlan,
        main_task: impl Into<String>,
        variables: Arc<VariableStore>,
    ) -> WorkflowRun {
        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let status = plan.agents.iter().map(|a| (a.id, NodeStatus::Pending)).collect();
        let reports = plan
            .agents
            .iter()
            .map(|a| {
                (
                    a.id,
                    NodeReport {
                        id: a.id,
                        capability: a.capability.clone(),
                        status: NodeStatus::Pending,
                        output: None,
                        failure: None,
                        message: None,
                        elapsed_ms: None,
                    },
                )
            })
            .collect();
        let driver = RunDriver {
            run_id: run_id.clone(),
            plan,
            main_task: main_task.into(),
            variables,
            registry: self.registry.clone(),
            config: self.config.clone(),
            event_bus: self.event_bus.clone(),
            cancel: cancel.clone(),
            status,
            reports,
            leased: BTreeSet::new(),
            leases: BTreeMap::new(),
        };
        WorkflowRun {
            run_id,
            cancel,
            handle: tokio::spawn(driver.drive()),
        }
    }

    /// Run to completion.
    pub async fn run(
        &self,
        plan: WorkflowPlan,
        main_task: impl Into<String>,
        variables: Arc<VariableStore>,
    ) -> Result<WorkflowResult> {
        self.start(plan, main_task, variables).wait().await
    }
}

/// Handle to a running workflow.
pub struct WorkflowRun {
    run_id: RunId,
    cancel: CancellationToken,
    handle: JoinHandle<WorkflowResult>,
}

impl WorkflowRun {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Cancel every running loop, including human waits and armed watches.
    /// Nothing further is launched.
    pub fn cancel(&self) {
        info!(run_id = %self.run_id, "Workflow cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<WorkflowResult> {
        self.handle
            .await
            .map_err(|e| WeftError::Internal(format!("scheduler task failed: {}", e)))
    }
}

type Finished = (AgentId, Result<String>, Duration);

struct RunDriver {
    run_id: RunId,
    plan: WorkflowPlan,
    main_task: String,
    variables: Arc<VariableStore>,
    registry: CapabilityRegistry,
    config: Arc<EngineConfig>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
    status: BTreeMap<AgentId, NodeStatus>,
    reports: BTreeMap<AgentId, NodeReport>,
    /// Surface ids held by running agents.
    leased: BTreeSet<String>,
    leases: BTreeMap<AgentId, String>,
}

impl RunDriver {
    async fn drive(mut self) -> WorkflowResult {
        info!(run_id = %self.run_id, agents = self.plan.agents.len(), "Workflow started");
        let mut running: JoinSet<Finished> = JoinSet::new();

        loop {
            if !self.cancel.is_cancelled() {
                self.promote();
                self.launch_ready(&mut running);
            }
            if running.is_empty() {
                break;
            }

            let joined = if self.cancel.is_cancelled() {
                running.join_next().await
            } else {
                tokio::select! {
                    joined = running.join_next() => joined,
                    _ = self.cancel.cancelled() => continue,
                }
            };
            match joined {
                Some(Ok((id, outcome, elapsed))) => self.finish(id, outcome, elapsed),
                Some(Err(e)) => error!(run_id = %self.run_id, error = %e, "Agent task lost"),
                None => break,
            }
        }

        self.conclude()
    }

    /// Pending nodes whose dependencies are all done become ready.
    fn promote(&mut self) {
        let ready: Vec<AgentId> = self
            .plan
            .agents
            .iter()
            .filter(|a| self.status.get(&a.id) == Some(&NodeStatus::Pending))
            .filter(|a| {
                a.depends_on
                    .iter()
                    .all(|d| self.status.get(d) == Some(&NodeStatus::Done))
            })
            .map(|a| a.id)
            .collect();
        for id in ready {
            self.set_status(id, NodeStatus::Ready, None);
        }
    }

    fn launch_ready(&mut self, running: &mut JoinSet<Finished>) {
        let limit = self.config.scheduler.max_concurrency.unwrap_or(usize::MAX).max(1);
        let ready: Vec<AgentId> = self
            .status
            .iter()
            .filter(|(_, s)| **s == NodeStatus::Ready)
            .map(|(id, _)| *id)
            .collect();

        for id in ready {
            if running.len() >= limit {
                debug!(run_id = %self.run_id, limit, "Concurrency limit reached");
                break;
            }
            let Some(node) = self.plan.get(id).cloned() else {
                continue;
            };
            let Some(factory) = self.registry.get(&node.capability) else {
                let e = WeftError::Config(format!(
                    "no agent registered for capability `{}`",
                    node.capability
                ));
                self.fail(id, &e, None);
                continue;
            };
            if let Some(surface) = factory.surface_id() {
                if self.leased.contains(&surface) {
                    debug!(agent_id = id, surface = %surface, "Waiting for surface lease");
                    continue;
                }
                self.leased.insert(surface.clone());
                self.leases.insert(id, surface);
            }

            let ctx = AgentRunContext {
                run_id: self.run_id.clone(),
                main_task: self.main_task.clone(),
                variables: self.variables.clone(),
                event_bus: self.event_bus.clone(),
                cancel: self.cancel.child_token(),
                prior: self.prior_results(id),
            };
            info!(run_id = %self.run_id, agent_id = id, capability = %node.capability, "Launching agent");
            let launch = factory.launch(node, ctx);
            self.set_status(id, NodeStatus::Running, None);

            running.spawn(async move {
                let started = Instant::now();
                let outcome = AssertUnwindSafe(launch)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(WeftError::Internal("agent task panicked".into())));
                (id, outcome, started.elapsed())
            });
        }
    }

    /// Final answers of completed ancestors, in id order.
    fn prior_results(&self, id: AgentId) -> Vec<(String, String)> {
        self.plan
            .ancestors(id)
            .into_iter()
            .filter_map(|a| {
                let node = self.plan.get(a)?;
                let output = self.reports.get(&a)?.output.clone()?;
                let label = format!("{} agent {}: {}", node.capability, a, excerpt(&node.task, 80));
                Some((label, output))
            })
            .collect()
    }

    fn finish(&mut self, id: AgentId, outcome: Result<String>, elapsed: Duration) {
        if let Some(surface) = self.leases.remove(&id) {
            self.leased.remove(&surface);
        }
        if let Some(report) = self.reports.get_mut(&id) {
            report.elapsed_ms = Some(elapsed.as_millis() as u64);
        }
        match outcome {
            Ok(output) => {
                info!(run_id = %self.run_id, agent_id = id, elapsed_ms = elapsed.as_millis() as u64, "Agent done");
                if let Some(report) = self.reports.get_mut(&id) {
                    report.output = Some(output);
                }
                self.set_status(id, NodeStatus::Done, None);
            }
            Err(e) => self.fail(id, &e, Some(elapsed)),
        }
    }

    /// Mark `id` failed and skip everything downstream of it.
    fn fail(&mut self, id: AgentId, e: &WeftError, elapsed: Option<Duration>) {
        let kind = FailureKind::of(e);
        match kind {
            FailureKind::Cancelled => info!(run_id = %self.run_id, agent_id = id, "Agent cancelled"),
            _ => warn!(
                run_id = %self.run_id,
                agent_id = id,
                failure = ?kind,
                elapsed_ms = elapsed.map(|d| d.as_millis() as u64),
                error = %e,
                "Agent failed"
            ),
        }
        if let Some(report) = self.reports.get_mut(&id) {
            report.failure = Some(kind);
            report.message = Some(e.to_string());
        }
        self.set_status(id, NodeStatus::Failed, Some(e.to_string()));

        for dependent in self.plan.dependents(id) {
            let waiting = matches!(
                self.status.get(&dependent),
                Some(NodeStatus::Pending | NodeStatus::Ready)
            );
            if waiting {
                let reason = format!("upstream agent {} failed", id);
                if let Some(report) = self.reports.get_mut(&dependent) {
                    report.message = Some(reason.clone());
                }
                self.set_status(dependent, NodeStatus::Skipped, Some(reason));
            }
        }
    }

    fn conclude(mut self) -> WorkflowResult {
        let cancelled = self.cancel.is_cancelled();
        let leftover: Vec<AgentId> = self
            .status
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in leftover {
            let (status, reason) = if self.status.get(&id) == Some(&NodeStatus::Running) {
                (NodeStatus::Failed, "agent task ended without a result")
            } else if cancelled {
                (NodeStatus::Skipped, "run cancelled")
            } else {
                (NodeStatus::Skipped, "never became ready")
            };
            if let Some(report) = self.reports.get_mut(&id) {
                if cancelled {
                    report.failure = Some(FailureKind::Cancelled);
                }
                report.message = Some(reason.to_string());
            }
            self.set_status(id, status, Some(reason.to_string()));
        }

        let count = |wanted: NodeStatus| self.status.values().filter(|s| **s == wanted).count();
        let done = count(NodeStatus::Done);
        let failed = count(NodeStatus::Failed);
        let skipped = count(NodeStatus::Skipped);
        let success = failed == 0 && skipped == 0;
        let mut summary = format!("{} done, {} failed, {} skipped", done, failed, skipped);
        if cancelled {
            summary.push_str(" (cancelled)");
        }

        info!(run_id = %self.run_id, success, summary = %summary, "Workflow finished");
        self.event_bus.publish(AgentEvent::new(
            self.run_id.clone(),
            None,
            EventKind::RunFinished {
                success,
                summary: summary.clone(),
            },
        ));

        WorkflowResult {
            run_id: self.run_id,
            success,
            summary,
            reports: self.reports,
            variables: self.variables.snapshot(),
        }
    }

    fn set_status(&mut self, id: AgentId, status: NodeStatus, detail: Option<String>) {
        self.status.insert(id, status);
        if let Some(report) = self.reports.get_mut(&id) {
            report.status = status;
        }
        debug!(run_id = %self.run_id, agent_id = id, status = %status, "Node status");
        self.event_bus.publish(AgentEvent::new(
            self.run_id.clone(),
            Some(id),
            EventKind::NodeStatus { status, detail },
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use serde_json::json;
    use weft_test_utils::DIAMOND_PLAN;
    use weft_tools::ToolRegistry;

    use crate::plan::{parse_plan, AgentNode};
    use crate::registry::AgentFactory;

    use super::*;

    const TRIO_PLAN: &str = r#"<root><name>Trio</name><thought>Independent work.</thought><agents>
        <agent name="Chat" id="0"><task>one</task></agent>
        <agent name="Chat" id="1"><task>two</task></agent>
        <agent name="Chat" id="2"><task>three</task></agent>
    </agents></root>"#;

    /// Agent stand-in keyed by task text.
    #[derive(Clone, Default)]
    struct Script {
        log: Arc<Mutex<Vec<String>>>,
        priors: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
        failing: BTreeSet<String>,
        over_budget: BTreeSet<String>,
        hanging: BTreeSet<String>,
        surface: Option<String>,
    }

    impl Script {
        fn failing(mut self, task: &str) -> Self {
            self.failing.insert(task.to_string());
            self
        }

        fn over_budget(mut self, task: &str) -> Self {
            self.over_budget.insert(task.to_string());
            self
        }

        fn hanging(mut self, task: &str) -> Self {
            self.hanging.insert(task.to_string());
            self
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn push(&self, line: String) {
            self.log.lock().unwrap().push(line);
        }
    }

    impl AgentFactory for Script {
        fn description(&self) -> &str {
            "scripted"
        }

        fn surface_id(&self) -> Option<String> {
            self.surface.clone()
        }

        fn tools(&self) -> ToolRegistry {
            ToolRegistry::new()
        }

        fn launch(&self, node: AgentNode, ctx: AgentRunContext) -> BoxFuture<'static, Result<String>> {
            let script = self.clone();
            Box::pin(async move {
                let task = node.task.clone();
                script.push(format!("start {}", task));
                script
                    .priors
                    .lock()
                    .unwrap()
                    .insert(task.clone(), ctx.prior.iter().map(|(l, _)| l.clone()).collect());
                if script.hanging.contains(&task) {
                    ctx.cancel.cancelled().await;
                    return Err(WeftError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                script.push(format!("end {}", task));
                if script.failing.contains(&task) {
                    return Err(WeftError::LlmRequest("503".into()));
                }
                if script.over_budget.contains(&task) {
                    return Err(WeftError::MaxTurnsExceeded(3));
                }
                ctx.variables
                    .set(task.clone(), json!(format!("{} output", task)), Some(node.id));
                Ok(format!("{} done", task))
            })
        }
    }

    fn scheduler(script: Script, config: EngineConfig) -> Scheduler {
        let mut registry = CapabilityRegistry::new();
        registry.register("Chat", script);
        Scheduler::new(registry, Arc::new(config), Arc::new(EventBus::default()))
    }

    fn plan(text: &str) -> WorkflowPlan {
        parse_plan(text, &["Chat"]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn diamond_runs_in_dependency_order() {
        let script = Script::default();
        let result = scheduler(script.clone(), EngineConfig::default())
            .run(plan(DIAMOND_PLAN), "diamond", Arc::new(VariableStore::new()))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.summary, "4 done, 0 failed, 0 skipped");

        let log = script.log();
        assert_eq!(&log[..2], &["start Collect the seed", "end Collect the seed"]);
        // Both branches start before either finishes.
        assert_eq!(&log[2..4], &["start Left branch", "start Right branch"]);
        assert_eq!(log[6], "start Join");

        let priors = script.priors.lock().unwrap();
        assert_eq!(priors["Join"].len(), 3);
        assert!(priors["Left branch"][0].starts_with("Chat agent 0: Collect the seed"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_branch_skips_dependents_and_keeps_sibling_output() {
        let script = Script::default().failing("Left branch");
        let result = scheduler(script.clone(), EngineConfig::default())
            .run(plan(DIAMOND_PLAN), "diamond", Arc::new(VariableStore::new()))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.status(0), Some(NodeStatus::Done));
        assert_eq!(result.status(1), Some(NodeStatus::Failed));
        assert_eq!(result.status(2), Some(NodeStatus::Done));
        assert_eq!(result.status(3), Some(NodeStatus::Skipped));
        assert_eq!(result.report(1).unwrap().failure, Some(FailureKind::Error));
        assert_eq!(result.report(3).unwrap().failure, None);
        assert_eq!(result.output(2), Some("Right branch done"));
        assert_eq!(result.variables["Right branch"], json!("Right branch output"));
        assert!(!script.log().contains(&"start Join".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_is_reported_distinctly() {
        let script = Script::default().over_budget("Collect the seed");
        let result = scheduler(script, EngineConfig::default())
            .run(plan(DIAMOND_PLAN), "diamond", Arc::new(VariableStore::new()))
            .await
            .unwrap();
        assert_eq!(result.report(0).unwrap().failure, Some(FailureKind::Budget));
        for id in 1..4 {
            assert_eq!(result.status(id), Some(NodeStatus::Skipped));
        }
        assert_eq!(result.summary, "0 done, 1 failed, 3 skipped");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_serializes_in_id_order() {
        let script = Script::default();
        let mut config = EngineConfig::default();
        config.scheduler.max_concurrency = Some(1);
        scheduler(script.clone(), config)
            .run(plan(TRIO_PLAN), "trio", Arc::new(VariableStore::new()))
            .await
            .unwrap();
        assert_eq!(
            script.log(),
            vec!["start one", "end one", "start two", "end two", "start three", "end three"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shared_surface_is_leased_to_one_agent_at_a_time() {
        let script = Script {
            surface: Some("tab-1".into()),
            ..Default::default()
        };
        let result = scheduler(script.clone(), EngineConfig::default())
            .run(plan(TRIO_PLAN), "trio", Arc::new(VariableStore::new()))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            script.log(),
            vec!["start one", "end one", "start two", "end two", "start three", "end three"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_running_agents_and_skips_the_rest() {
        let script = Script::default()
            .hanging("Left branch")
            .hanging("Right branch");
        let sched = scheduler(script.clone(), EngineConfig::default());
        let mut events = sched.event_bus.subscribe();
        let run = sched.start(plan(DIAMOND_PLAN), "diamond", Arc::new(VariableStore::new()));

        while script.log().len() < 4 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        run.cancel();
        let result = run.wait().await.unwrap();

        assert!(!result.success);
        assert_eq!(result.status(0), Some(NodeStatus::Done));
        for id in [1, 2] {
            assert_eq!(result.status(id), Some(NodeStatus::Failed));
            assert_eq!(result.report(id).unwrap().failure, Some(FailureKind::Cancelled));
        }
        assert_eq!(result.status(3), Some(NodeStatus::Skipped));
        assert!(result.summary.ends_with("(cancelled)"));

        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let EventKind::RunFinished { success, .. } = event.kind {
                finished = Some(success);
            }
        }
        assert_eq!(finished, Some(false));
    }
}
