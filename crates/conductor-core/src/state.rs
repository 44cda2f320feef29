use crate::error::ConductorResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Persisted view of an agent used by recovery.
///
/// `config` survives every recovery strategy; `memory` is the agent's
/// working memory; `runtime` holds transient execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Free-form status label, e.g. `ready` or `error`.
    pub status: String,
    /// Configuration the agent was initialized with.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Working memory.
    #[serde(default)]
    pub memory: serde_json::Map<String, serde_json::Value>,
    /// Transient execution state.
    #[serde(default)]
    pub runtime: serde_json::Map<String, serde_json::Value>,
    /// Text of the most recent failure; recovery strategies match on it.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Critical failures are excluded from automatic restarts.
    #[serde(default)]
    pub critical: bool,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    /// Fresh state with the given status and empty maps.
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            config: serde_json::Value::Null,
            memory: serde_json::Map::new(),
            runtime: serde_json::Map::new(),
            last_error: None,
            critical: false,
            updated_at: Utc::now(),
        }
    }

    /// Set the initialization config.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Record the failure that led to this state.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Mark the failure as critical.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Agent state store supplied by the host application.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Current state of an agent, if any was stored.
    async fn get_state(&self, agent_id: &str) -> Option<AgentState>;
    /// Replace an agent's state. `reason` is kept for auditing.
    async fn set_state(&self, agent_id: &str, state: AgentState, reason: &str)
        -> ConductorResult<()>;
}

/// One write applied through [`InMemoryStateManager::set_state`].
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Agent the write applied to.
    pub agent_id: String,
    /// Reason given by the writer.
    pub reason: String,
    /// Time of the write.
    pub at: DateTime<Utc>,
}

/// State store backed by an in-process map.
pub struct InMemoryStateManager {
    states: RwLock<HashMap<String, AgentState>>,
    changes: RwLock<Vec<StateChange>>,
}

impl InMemoryStateManager {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            changes: RwLock::new(Vec::new()),
        }
    }

    /// Every write applied so far, oldest first.
    pub async fn changes(&self) -> Vec<StateChange> {
        self.changes.read().await.clone()
    }
}

impl Default for InMemoryStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateManager for InMemoryStateManager {
    async fn get_state(&self, agent_id: &str) -> Option<AgentState> {
        self.states.read().await.get(agent_id).cloned()
    }

    async fn set_state(
        &self,
        agent_id: &str,
        mut state: AgentState,
        reason: &str,
    ) -> ConductorResult<()> {
        debug!(agent_id = %agent_id, reason = %reason, status = %state.status, "State updated");
        state.updated_at = Utc::now();
        self.states.write().await.insert(agent_id.to_string(), state);
        self.changes.write().await.push(StateChange {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get_state() {
        let manager = InMemoryStateManager::new();
        assert!(manager.get_state("a").await.is_none());

        let state = AgentState::new("error").with_error("boom");
        manager.set_state("a", state, "test").await.unwrap();

        let stored = manager.get_state("a").await.unwrap();
        assert_eq!(stored.status, "error");
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert_eq!(manager.changes().await.len(), 1);
    }

    #[test]
    fn test_state_serialization_defaults() {
        let json = serde_json::json!({
            "status": "running",
            "updated_at": "2024-01-01T00:00:00Z"
        });
        let state: AgentState = serde_json::from_value(json).unwrap();
        assert!(state.memory.is_empty());
        assert!(!state.critical);
        assert!(state.last_error.is_none());
    }
}
