use crate::error::ConductorResult;
use crate::task::Task;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// An autonomous worker the engine drives.
///
/// Lifecycle hooks are optional: the default implementations succeed without
/// doing anything. Only [`Agent::execute_task`] must be provided.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Free-form classification used by prioritization rules.
    fn agent_type(&self) -> &str {
        "generic"
    }

    /// Prepare the agent to take work. `config` is passed through from the caller.
    async fn initialize(&self, _config: Option<&serde_json::Value>) -> ConductorResult<()> {
        Ok(())
    }

    /// Release resources before the agent leaves the running set.
    async fn shutdown(&self) -> ConductorResult<()> {
        Ok(())
    }

    /// Stop taking work without releasing resources.
    async fn pause(&self) -> ConductorResult<()> {
        Ok(())
    }

    /// Continue after [`Agent::pause`].
    async fn resume(&self) -> ConductorResult<()> {
        Ok(())
    }

    /// Run one task and return its result.
    async fn execute_task(&self, task: &Task) -> ConductorResult<serde_json::Value>;
}

/// Lookup of agents by id, supplied by the host application.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Look up a registered agent.
    async fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>>;
    /// Every registered agent with its id.
    async fn all_agents(&self) -> Vec<(String, Arc<dyn Agent>)>;
}

/// Registry backed by an in-process map.
pub struct InMemoryAgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl InMemoryAgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register `agent` under `agent_id`, replacing any previous entry.
    pub async fn register(&self, agent_id: impl Into<String>, agent: Arc<dyn Agent>) {
        let agent_id = agent_id.into();
        info!(agent_id = %agent_id, agent_type = agent.agent_type(), "Registered agent");
        self.agents.write().await.insert(agent_id, agent);
    }

    /// Remove an agent. Returns `false` when it was not registered.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        self.agents.write().await.remove(agent_id).is_some()
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Whether no agent is registered.
    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

impl Default for InMemoryAgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    async fn all_agents(&self) -> Vec<(String, Arc<dyn Agent>)> {
        let agents = self.agents.read().await;
        let mut all: Vec<(String, Arc<dyn Agent>)> = agents
            .iter()
            .map(|(id, agent)| (id.clone(), Arc::clone(agent)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn execute_task(&self, task: &Task) -> ConductorResult<serde_json::Value> {
            Ok(task.payload.clone())
        }
    }

    #[tokio::test]
    async fn test_default_hooks_are_noops() {
        let agent = EchoAgent;
        assert!(agent.initialize(None).await.is_ok());
        assert!(agent.pause().await.is_ok());
        assert!(agent.resume().await.is_ok());
        assert!(agent.shutdown().await.is_ok());
        assert_eq!(agent.agent_type(), "generic");
    }

    #[tokio::test]
    async fn test_registry_register_and_lookup() {
        let registry = InMemoryAgentRegistry::new();
        registry.register("b", Arc::new(EchoAgent)).await;
        registry.register("a", Arc::new(EchoAgent)).await;

        assert!(registry.get_agent("a").await.is_some());
        assert!(registry.get_agent("missing").await.is_none());

        let ids: Vec<String> = registry.all_agents().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        assert!(registry.unregister("a").await);
        assert!(!registry.unregister("a").await);
        assert_eq!(registry.len().await, 1);
    }
}
