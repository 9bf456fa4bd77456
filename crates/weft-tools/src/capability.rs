use std::sync::Arc;

use weft_core::config::EscalationConfig;
use weft_core::traits::{BrowserSurface, Tool};

use crate::builtin::{browser_tools, HumanInteractTool, TaskNodeStatusTool, VariableStorageTool};
use crate::registry::ToolRegistry;

/// What the engine provides to every capability when tools are loaded.
#[derive(Debug, Clone, Default)]
pub struct ToolLoadContext {
    /// A human channel is attached to the run.
    pub human_available: bool,
    pub escalation: EscalationConfig,
}

/// Drives a live browser-like surface.
#[derive(Clone)]
pub struct BrowserCapability {
    pub surface: Arc<dyn BrowserSurface>,
    pub description: String,
}

impl BrowserCapability {
    pub fn new(surface: Arc<dyn BrowserSurface>) -> Self {
        Self {
            surface,
            description: "Operates a web browser: navigates, reads pages, fills forms and \
                          clicks through sites."
                .to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A caller-supplied tool set, optionally bound to an exclusive surface.
#[derive(Clone)]
pub struct Toolset {
    pub description: String,
    pub tools: Vec<Arc<dyn Tool>>,
    pub surface: Option<Arc<dyn BrowserSurface>>,
}

impl Toolset {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            tools: Vec::new(),
            surface: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Tool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_surface(mut self, surface: Arc<dyn BrowserSurface>) -> Self {
        self.surface = Some(surface);
        self
    }
}

/// Pure conversation; no environment.
#[derive(Debug, Clone)]
pub struct ChatCapability {
    pub description: String,
}

impl Default for ChatCapability {
    fn default() -> Self {
        Self {
            description: "Answers, summarizes and transforms text without touching any \
                          environment."
                .to_string(),
        }
    }
}

/// The closed set of agent capabilities a plan can name.
#[derive(Clone)]
pub enum Capability {
    Browser(BrowserCapability),
    Computer(Toolset),
    File(Toolset),
    Chat(ChatCapability),
}

impl Capability {
    pub fn browser(surface: Arc<dyn BrowserSurface>) -> Self {
        Self::Browser(BrowserCapability::new(surface))
    }

    pub fn chat() -> Self {
        Self::Chat(ChatCapability::default())
    }

    /// Default registry name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Browser(_) => "Browser",
            Self::Computer(_) => "Computer",
            Self::File(_) => "File",
            Self::Chat(_) => "Chat",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Browser(b) => &b.description,
            Self::Computer(t) | Self::File(t) => &t.description,
            Self::Chat(c) => &c.description,
        }
    }

    /// The exclusive surface this capability drives, if any.
    pub fn surface(&self) -> Option<Arc<dyn BrowserSurface>> {
        match self {
            Self::Browser(b) => Some(b.surface.clone()),
            Self::Computer(t) | Self::File(t) => t.surface.clone(),
            Self::Chat(_) => None,
        }
    }

    /// Capability tools plus the engine's built-in tools.
    pub fn load_tools(&self, ctx: &ToolLoadContext) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        match self {
            Self::Browser(_) => registry.extend(browser_tools()),
            Self::Computer(t) | Self::File(t) => registry.extend(t.tools.iter().cloned()),
            Self::Chat(_) => {}
        }
        registry.register(VariableStorageTool);
        registry.register(TaskNodeStatusTool);
        if ctx.human_available {
            registry.register(HumanInteractTool::new(ctx.escalation.clone()));
        }
        registry
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("kind", &self.kind_name())
            .field("surface", &self.surface().map(|s| s.surface_id().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use weft_test_utils::MockSurface;

    use super::*;

    #[test]
    fn browser_loads_browser_and_engine_tools() {
        let cap = Capability::browser(Arc::new(MockSurface::new("tab-1")));
        let tools = cap.load_tools(&ToolLoadContext::default());
        assert!(tools.contains("navigate_to"));
        assert!(tools.contains("variable_storage"));
        assert!(!tools.contains("human_interact"));
        assert_eq!(cap.surface().unwrap().surface_id(), "tab-1");
    }

    #[test]
    fn chat_has_no_surface() {
        let cap = Capability::chat();
        let tools = cap.load_tools(&ToolLoadContext {
            human_available: true,
            ..Default::default()
        });
        assert!(cap.surface().is_none());
        assert!(tools.contains("human_interact"));
        assert!(!tools.contains("navigate_to"));
        assert_eq!(cap.kind_name(), "Chat");
    }
}
