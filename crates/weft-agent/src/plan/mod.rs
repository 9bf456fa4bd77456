//! Plan model: the document form the planner writes, the reader for its
//! markup, and the validated [`WorkflowPlan`] the scheduler runs.

pub mod document;
pub mod markup;
pub mod model;
pub mod parser;

pub use document::PlanDocument;
pub use markup::{parse_any, parse_markup};
pub use model::{
    AgentNode, ForEach, ItemsSource, Step, StepItem, VariableLint, Watch, WorkflowPlan,
};
pub use parser::{parse_plan, validate};
