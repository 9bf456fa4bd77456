use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use weft_core::config::EngineConfig;
use weft_core::error::Result;
use weft_core::traits::{HumanChannel, LlmClient};
use weft_tools::{Capability, ToolLoadContext, ToolRegistry};

use crate::agent_loop::{AgentRunContext, ExecutionLoop};
use crate::plan::AgentNode;

/// Builds and runs the execution loop for one capability.
pub trait AgentFactory: Send + Sync + 'static {
    fn description(&self) -> &str;

    /// Identity of the exclusive surface this capability drives.
    fn surface_id(&self) -> Option<String> {
        None
    }

    /// Tools the loop will expose, for planning prompts.
    fn tools(&self) -> ToolRegistry;

    /// Run `node` to completion; resolves to the final answer.
    fn launch(&self, node: AgentNode, ctx: AgentRunContext) -> BoxFuture<'static, Result<String>>;
}

/// Standard factory: an [`ExecutionLoop`] over a [`Capability`].
pub struct LoopFactory {
    capability: Capability,
    llm: Arc<dyn LlmClient>,
    config: Arc<EngineConfig>,
    human: Option<Arc<dyn HumanChannel>>,
}

impl LoopFactory {
    pub fn new(capability: Capability, llm: Arc<dyn LlmClient>, config: Arc<EngineConfig>) -> Self {
        Self {
            capability,
            llm,
            config,
            human: None,
        }
    }

    pub fn with_human(mut self, human: Arc<dyn HumanChannel>) -> Self {
        self.human = Some(human);
        self
    }
}

impl AgentFactory for LoopFactory {
    fn description(&self) -> &str {
        self.capability.description()
    }

    fn surface_id(&self) -> Option<String> {
        self.capability.surface().map(|s| s.surface_id().to_string())
    }

    fn tools(&self) -> ToolRegistry {
        self.capability.load_tools(&ToolLoadContext {
            human_available: self.human.is_some(),
            escalation: self.config.escalation.clone(),
        })
    }

    fn launch(&self, node: AgentNode, ctx: AgentRunContext) -> BoxFuture<'static, Result<String>> {
        let mut agent = ExecutionLoop::new(
            node,
            &self.capability,
            self.llm.clone(),
            self.config.clone(),
            ctx,
        );
        if let Some(human) = &self.human {
            agent = agent.with_human(&self.capability, human.clone());
        }
        Box::pin(agent.run())
    }
}

/// Capability name to factory. Plans are validated against [`Self::names`].
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    factories: BTreeMap<String, Arc<dyn AgentFactory>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: impl AgentFactory) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register `capability` under its kind name with the standard loop.
    pub fn register_capability(
        &mut self,
        capability: Capability,
        llm: Arc<dyn LlmClient>,
        config: Arc<EngineConfig>,
        human: Option<Arc<dyn HumanChannel>>,
    ) {
        let name = capability.kind_name();
        let mut factory = LoopFactory::new(capability, llm, config);
        if let Some(human) = human {
            factory = factory.with_human(human);
        }
        self.register(name, factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn AgentFactory>)> {
        self.factories.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
