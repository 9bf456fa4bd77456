use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use weft_agent::plan::parse_plan;
use weft_agent::{CapabilityRegistry, FailureKind, HumanBroker, Scheduler, WorkflowPlan};
use weft_core::config::EngineConfig;
use weft_core::event::{EventBus, EventKind};
use weft_core::human::EscalationResponse;
use weft_core::surface::WatchEvent;
use weft_core::traits::HumanChannel;
use weft_core::types::{ContentBlock, LoopState, NodeStatus, Role};
use weft_core::variables::VariableStore;
use weft_test_utils::{MockLlm, MockReply, MockSurface, DIAMOND_PLAN, FOREACH_PLAN};
use weft_tools::Capability;

struct Engine {
    scheduler: Scheduler,
    bus: Arc<EventBus>,
}

impl Engine {
    fn new(llm: Arc<MockLlm>, surface: Option<Arc<MockSurface>>) -> Self {
        Self::build(llm, surface, |_| None)
    }

    fn build(
        llm: Arc<MockLlm>,
        surface: Option<Arc<MockSurface>>,
        human: impl Fn(Arc<EventBus>) -> Option<Arc<dyn HumanChannel>>,
    ) -> Self {
        let bus = Arc::new(EventBus::default());
        let config = Arc::new(EngineConfig::default());
        let human = human(bus.clone());
        let mut registry = CapabilityRegistry::new();
        registry.register_capability(Capability::chat(), llm.clone(), config.clone(), human.clone());
        if let Some(surface) = surface {
            registry.register_capability(Capability::browser(surface), llm, config.clone(), human);
        }
        Self {
            scheduler: Scheduler::new(registry, config, bus.clone()),
            bus,
        }
    }

    fn plan(&self, text: &str) -> WorkflowPlan {
        parse_plan(text, &self.scheduler.registry().names()).expect("valid plan")
    }
}

fn single_browser_agent(nodes: &str) -> String {
    format!(
        r#"<root><name>Single</name><thought>One browser agent.</thought><agents>
<agent name="Browser" id="0" dependsOn=""><task>Work the page</task><nodes>{}</nodes></agent>
</agents></root>"#,
        nodes
    )
}

#[tokio::test]
async fn diamond_branch_failure_skips_join_and_keeps_sibling_output() {
    let llm = Arc::new(MockLlm::from_fn(|req| {
        let last = req.last_user_text();
        if last.contains("Derive left") {
            MockReply::Error("upstream 503".into())
        } else if last.contains("Produce the seed") {
            MockReply::text("SEED-42")
        } else {
            MockReply::text("done")
        }
    }));
    let engine = Engine::new(llm.clone(), None);
    let result = engine
        .scheduler
        .run(engine.plan(DIAMOND_PLAN), "Fan out and join", Arc::new(VariableStore::new()))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.status(0), Some(NodeStatus::Done));
    assert_eq!(result.status(1), Some(NodeStatus::Failed));
    assert_eq!(result.status(2), Some(NodeStatus::Done));
    assert_eq!(result.status(3), Some(NodeStatus::Skipped));
    assert_eq!(result.report(1).unwrap().failure, Some(FailureKind::Error));

    assert_eq!(result.variables["seed"], json!("SEED-42"));
    assert_eq!(result.variables["right"], json!("done"));
    assert!(!result.variables.contains_key("left"));

    let requests = llm.requests();
    let position = |needle: &str| {
        requests
            .iter()
            .position(|r| r.last_user_text().contains(needle))
            .unwrap()
    };
    assert!(position("Produce the seed") < position("Derive left"));
    assert!(position("Produce the seed") < position("Derive right"));
    assert!(!requests.iter().any(|r| r.last_user_text().contains("Combine")));

    // The right branch saw the seed through the variable store and the
    // upstream excerpt.
    let right = &requests[position("Derive right")];
    assert!(right.last_user_text().contains("Input variable `seed`:\nSEED-42"));
    assert!(right.system_text().contains("# Results of earlier agents"));
}

#[tokio::test]
async fn element_not_found_is_an_observation_not_a_failure() {
    let surface = Arc::new(MockSurface::new("tab"));
    surface.remove_element(2);
    let llm = Arc::new(MockLlm::with_replies(vec![
        MockReply::tool("click_element", json!({"index": 2})),
        MockReply::text("The search button is not on the page."),
    ]));
    let engine = Engine::new(llm.clone(), Some(surface.clone()));
    let plan = engine.plan(&single_browser_agent("<node>Click the search button</node>"));
    let result = engine
        .scheduler
        .run(plan, "Search", Arc::new(VariableStore::new()))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.output(0), Some("The search button is not on the page."));

    let observation = llm.requests()[1].last_tool_results();
    assert_eq!(observation.len(), 1);
    assert!(observation[0].1);
    assert!(observation[0].0.contains("Element not found: index 2"));
    assert_eq!(surface.snapshot_count(), 1);
}

#[tokio::test]
async fn for_each_runs_items_in_order_on_one_loop() {
    let surface = Arc::new(MockSurface::new("tab"));
    let llm = Arc::new(MockLlm::from_fn(|req| {
        let last = req.last_user_text();
        match last.lines().find_map(|l| l.strip_prefix("Current item: ")) {
            Some(item) => MockReply::text(format!("visited {}", item)),
            None => MockReply::text("catalogue open"),
        }
    }));
    let engine = Engine::new(llm.clone(), Some(surface));
    let result = engine
        .scheduler
        .run(engine.plan(FOREACH_PLAN), "Visit products", Arc::new(VariableStore::new()))
        .await
        .unwrap();

    assert!(result.success);
    let items: Vec<String> = llm
        .requests()
        .iter()
        .filter_map(|r| {
            r.last_user_text()
                .lines()
                .find_map(|l| l.strip_prefix("Current item: ").map(str::to_string))
        })
        .collect();
    assert_eq!(items, vec!["alpha", "beta", "gamma"]);
    assert!(llm.requests()[0]
        .last_user_text()
        .contains("Current step (0): Open the catalogue"));
    assert_eq!(result.variables["last_visited"], json!("visited gamma"));
}

#[tokio::test]
async fn older_snapshots_are_compacted_newest_two_kept() {
    let surface = Arc::new(MockSurface::new("tab"));
    let llm = Arc::new(MockLlm::from_fn(|req| {
        let turns = req.messages.iter().filter(|m| m.role == Role::Assistant).count();
        if turns < 5 {
            MockReply::tool("click_element", json!({"index": 2}))
        } else {
            MockReply::text("clicked five times")
        }
    }));
    let engine = Engine::new(llm.clone(), Some(surface.clone()));
    let plan = engine.plan(&single_browser_agent("<node>Click search five times</node>"));
    let result = engine
        .scheduler
        .run(plan, "Click", Arc::new(VariableStore::new()))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(surface.snapshot_count(), 5);

    let last = llm.requests().pop().unwrap();
    let snapshots: Vec<_> = last.messages.iter().filter(|m| m.is_snapshot()).collect();
    assert_eq!(snapshots.len(), 5);

    for old in &snapshots[..3] {
        let text = old.text();
        assert!(text.contains("[2]:<button>Search</button>"));
        assert!(!text.contains("class="));
        assert!(text.contains("[image]"));
        assert!(!old.content.iter().any(|b| matches!(b, ContentBlock::Image { .. })));
    }
    for recent in &snapshots[3..] {
        assert!(recent.text().contains(r#"[2]:<button class="btn btn-primary">Search</button>"#));
        assert!(recent.content.iter().any(|b| matches!(b, ContentBlock::Image { .. })));
    }
}

#[tokio::test]
async fn watch_fires_trigger_and_is_removed_when_the_agent_ends() {
    let surface = Arc::new(MockSurface::new("tab"));
    let emitter = surface.clone();
    let llm = Arc::new(MockLlm::from_fn(move |req| {
        if req.last_user_text().contains("Wait for rows") {
            emitter.emit(WatchEvent::Dom, "row 1 added");
            MockReply::text("waited")
        } else {
            MockReply::text("recorded")
        }
    }));
    let engine = Engine::new(llm.clone(), Some(surface.clone()));
    let plan = engine.plan(&single_browser_agent(
        r#"<watch event="dom" loop="true">
             <description>new rows</description>
             <trigger><node>Record the new row</node></trigger>
           </watch>
           <node>Wait for rows</node>"#,
    ));
    let result = engine
        .scheduler
        .run(plan, "Monitor", Arc::new(VariableStore::new()))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.output(0), Some("recorded"));
    let last = llm.requests().pop().unwrap();
    assert!(last
        .transcript()
        .contains("The watched dom event fired (new rows): row 1 added"));
    assert!(last.last_user_text().contains("Current step (watch.0): Record the new row"));
    assert_eq!(surface.watcher_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn escalation_suspends_until_the_operator_answers() {
    let llm = Arc::new(MockLlm::with_replies(vec![
        MockReply::tool(
            "human_interact",
            json!({"interactType": "confirm", "prompt": "Delete the report?"}),
        ),
        MockReply::text("Report deleted."),
    ]));
    let brokers: Arc<std::sync::Mutex<Option<Arc<HumanBroker>>>> = Default::default();
    let slot = brokers.clone();
    let engine = Engine::build(llm.clone(), None, move |bus| {
        let broker = Arc::new(HumanBroker::new(bus));
        *slot.lock().unwrap() = Some(broker.clone());
        Some(broker as Arc<dyn HumanChannel>)
    });
    let broker = brokers.lock().unwrap().clone().unwrap();

    let mut events = engine.bus.subscribe();
    let responder = tokio::spawn(async move {
        let mut saw_waiting = false;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event.kind {
                EventKind::AgentState {
                    state: LoopState::AwaitingHuman,
                } => saw_waiting = true,
                EventKind::EscalationRequested { request } => {
                    assert!(broker.respond(&request.id, EscalationResponse::Confirmed(true)));
                }
                EventKind::RunFinished { .. } => break,
                _ => {}
            }
        }
        saw_waiting
    });

    let plan = engine.plan(
        r#"<root><name>Cleanup</name><agents><agent name="Chat" id="0"><task>Delete the old report</task></agent></agents></root>"#,
    );
    let result = engine
        .scheduler
        .run(plan, "Clean up", Arc::new(VariableStore::new()))
        .await
        .unwrap();

    assert!(result.success);
    assert!(responder.await.unwrap());
    let answer = llm.requests()[1].last_tool_results();
    assert_eq!(answer, vec![("The user confirmed.".to_string(), false)]);
}

#[tokio::test]
async fn cancelling_a_run_withdraws_pending_escalations() {
    let llm = Arc::new(MockLlm::with_replies(vec![MockReply::tool(
        "human_interact",
        json!({"interactType": "input", "prompt": "Which account?"}),
    )]));
    let brokers: Arc<std::sync::Mutex<Option<Arc<HumanBroker>>>> = Default::default();
    let slot = brokers.clone();
    let engine = Engine::build(llm, None, move |bus| {
        let broker = Arc::new(HumanBroker::new(bus));
        *slot.lock().unwrap() = Some(broker.clone());
        Some(broker as Arc<dyn HumanChannel>)
    });
    let broker = brokers.lock().unwrap().clone().unwrap();

    let plan = engine.plan(
        r#"<root><name>Login</name><agents>
             <agent name="Chat" id="0"><task>Log in</task></agent>
             <agent name="Chat" id="1" dependsOn="0"><task>Download statements</task></agent>
           </agents></root>"#,
    );
    let run = engine
        .scheduler
        .start(plan, "Get statements", Arc::new(VariableStore::new()));

    while broker.pending_requests().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    run.cancel();
    let result = run.wait().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.status(0), Some(NodeStatus::Failed));
    assert_eq!(result.report(0).unwrap().failure, Some(FailureKind::Cancelled));
    assert_eq!(result.status(1), Some(NodeStatus::Skipped));
    assert!(broker.pending_requests().is_empty());
}
