pub mod config;
pub mod error;
pub mod event;
pub mod human;
pub mod surface;
pub mod traits;
pub mod types;
pub mod variables;

pub use config::EngineConfig;
pub use error::{ErrorClass, PlanErrorReason, PlanValidationError, Result, WeftError};
pub use event::{AgentEvent, EventBus, EventKind};
pub use types::*;
pub use variables::VariableStore;
