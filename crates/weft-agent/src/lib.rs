pub mod agent_loop;
pub mod compaction;
pub mod context;
pub mod escalation;
pub mod extraction;
pub mod plan;
pub mod planner;
pub mod registry;
pub mod scheduler;
pub mod steps;
pub mod watch;

pub use agent_loop::{AgentRunContext, ExecutionLoop};
pub use escalation::HumanBroker;
pub use extraction::ExtractionPolicy;
pub use plan::{parse_plan, validate, AgentNode, StepItem, WorkflowPlan};
pub use planner::Planner;
pub use registry::{AgentFactory, CapabilityRegistry, LoopFactory};
pub use scheduler::{FailureKind, NodeReport, Scheduler, WorkflowResult, WorkflowRun};
pub use steps::StepBoard;
pub use watch::WatchSet;
