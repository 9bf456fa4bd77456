pub mod builtin;
pub mod capability;
pub mod registry;

pub use capability::{BrowserCapability, Capability, ChatCapability, ToolLoadContext, Toolset};
pub use registry::ToolRegistry;
