pub mod browser;
pub mod human;
pub mod steps;
pub mod variables;

pub use browser::browser_tools;
pub use human::{HumanInteractTool, HUMAN_INTERACT};
pub use steps::{TaskNodeStatusTool, TASK_NODE_STATUS};
pub use variables::{VariableStorageTool, VARIABLE_STORAGE};
