use crate::config::RecoveryConfig;
use crate::events::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    AgentState, ConductorError, ConductorResult, Metric, MonitoringService, StateManager,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a strategy sees when asked to recover an agent.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    /// Agent being recovered.
    pub agent_id: String,
    /// Stored state before recovery.
    pub state: AgentState,
    /// The failure that triggered recovery, taken from the stored state.
    pub error: Option<String>,
    /// 1-based number of this recovery attempt for the agent.
    pub attempt: u32,
    /// Time of the attempt.
    pub timestamp: DateTime<Utc>,
}

impl RecoveryContext {
    fn error_mentions(&self, needles: &[&str]) -> bool {
        self.error.as_deref().is_some_and(|e| {
            let lower = e.to_lowercase();
            needles.iter().any(|n| lower.contains(n))
        })
    }
}

/// Result of a successful recovery action.
#[derive(Debug, Clone, Default)]
pub struct RecoveryOutcome {
    /// State to persist through the state manager.
    pub new_state: Option<AgentState>,
    /// The failed work may be retried as-is.
    pub retry: bool,
    /// Human-readable summary.
    pub message: Option<String>,
}

/// Pluggable policy for restoring an agent after a failure.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Unique name per agent.
    fn name(&self) -> &str;

    /// Higher runs first.
    fn priority(&self) -> u8;

    /// Whether this strategy can handle the failure.
    fn applies_to(&self, ctx: &RecoveryContext) -> bool;

    /// Attempt recovery. An error moves on to the next strategy.
    async fn recover(&self, ctx: &RecoveryContext) -> ConductorResult<RecoveryOutcome>;
}

/// Full restart: drops memory and runtime state, keeps configuration.
/// Skipped for critical failures.
pub struct RestartStrategy;

#[async_trait]
impl RecoveryStrategy for RestartStrategy {
    fn name(&self) -> &str {
        "restart"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn applies_to(&self, ctx: &RecoveryContext) -> bool {
        !ctx.state.critical
    }

    async fn recover(&self, ctx: &RecoveryContext) -> ConductorResult<RecoveryOutcome> {
        let state = AgentState::new("initializing").with_config(ctx.state.config.clone());
        Ok(RecoveryOutcome {
            new_state: Some(state),
            retry: false,
            message: Some("agent state reset for restart".into()),
        })
    }
}

/// Clears working memory when the failure points at corrupted state.
pub struct ResetStrategy;

#[async_trait]
impl RecoveryStrategy for ResetStrategy {
    fn name(&self) -> &str {
        "reset"
    }

    fn priority(&self) -> u8 {
        5
    }

    fn applies_to(&self, ctx: &RecoveryContext) -> bool {
        ctx.error_mentions(&["state", "memory"])
    }

    async fn recover(&self, ctx: &RecoveryContext) -> ConductorResult<RecoveryOutcome> {
        let mut state = ctx.state.clone();
        state.memory.clear();
        state.last_error = None;
        state.status = "ready".into();
        Ok(RecoveryOutcome {
            new_state: Some(state),
            retry: false,
            message: Some("working memory cleared".into()),
        })
    }
}

/// Marks transient failures as retryable without touching state.
pub struct RetryStrategy;

const TRANSIENT_MARKERS: &[&str] = &[
    "transient",
    "timeout",
    "timed out",
    "network",
    "connection",
    "unavailable",
    "rate limit",
];

#[async_trait]
impl RecoveryStrategy for RetryStrategy {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn applies_to(&self, ctx: &RecoveryContext) -> bool {
        ctx.error_mentions(TRANSIENT_MARKERS)
    }

    async fn recover(&self, _ctx: &RecoveryContext) -> ConductorResult<RecoveryOutcome> {
        Ok(RecoveryOutcome {
            new_state: None,
            retry: true,
            message: Some("transient failure, retry eligible".into()),
        })
    }
}

/// One strategy invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    /// Attempt id.
    pub id: Uuid,
    /// Agent recovered.
    pub agent_id: String,
    /// Strategy that ran.
    pub strategy: String,
    /// Whether the strategy succeeded.
    pub success: bool,
    /// Whether the failed work may be retried.
    pub retry: bool,
    /// Strategy run time.
    pub duration_ms: u64,
    /// Failure text when unsuccessful.
    pub error: Option<String>,
    /// Time of the attempt.
    pub at: DateTime<Utc>,
}

/// Aggregates over recorded attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    /// Attempts recorded.
    pub total_attempts: usize,
    /// Successful attempts.
    pub successful: usize,
    /// Failed attempts.
    pub failed: usize,
    /// `successful / total_attempts`, or 0 with no attempts.
    pub success_rate: f64,
    /// Mean strategy run time.
    pub average_duration_ms: f64,
}

/// Notifications published by error recovery.
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    /// A strategy was registered for an agent.
    StrategyRegistered {
        /// Owning agent.
        agent_id: String,
        /// Strategy name.
        strategy: String,
    },
    /// A strategy returned an error.
    StrategyFailed {
        /// Agent being recovered.
        agent_id: String,
        /// Strategy name.
        strategy: String,
        /// Failure text.
        error: String,
    },
    /// A strategy succeeded.
    Recovered {
        /// Recovered agent.
        agent_id: String,
        /// Strategy that succeeded.
        strategy: String,
        /// Whether the failed work may be retried.
        retry: bool,
    },
    /// No applicable strategy succeeded.
    RecoveryExhausted {
        /// Agent left unrecovered.
        agent_id: String,
    },
}

/// Runs per-agent recovery strategies, highest priority first.
pub struct ErrorRecovery {
    config: RecoveryConfig,
    strategies: RwLock<HashMap<String, Vec<Arc<dyn RecoveryStrategy>>>>,
    attempts: RwLock<HashMap<String, VecDeque<RecoveryAttempt>>>,
    recoveries: RwLock<HashMap<String, u32>>,
    monitoring: Arc<dyn MonitoringService>,
    events: EventBus<RecoveryEvent>,
}

impl ErrorRecovery {
    /// Recovery with no strategies registered.
    pub fn new(config: RecoveryConfig, monitoring: Arc<dyn MonitoringService>) -> Self {
        Self {
            config,
            strategies: RwLock::new(HashMap::new()),
            attempts: RwLock::new(HashMap::new()),
            recoveries: RwLock::new(HashMap::new()),
            monitoring,
            events: EventBus::default(),
        }
    }

    /// Receive recovery notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Add a strategy for an agent. Names are unique per agent.
    pub async fn register_strategy(
        &self,
        agent_id: &str,
        strategy: Arc<dyn RecoveryStrategy>,
    ) -> ConductorResult<()> {
        let name = strategy.name().to_string();
        {
            let mut strategies = self.strategies.write().await;
            let list = strategies.entry(agent_id.to_string()).or_default();
            if list.iter().any(|s| s.name() == name) {
                return Err(ConductorError::Config(format!(
                    "strategy '{name}' already registered for agent {agent_id}"
                )));
            }
            list.push(strategy);
            // stable: equal priorities keep registration order
            list.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        }
        debug!(agent_id = %agent_id, strategy = %name, "Recovery strategy registered");
        self.events.publish(RecoveryEvent::StrategyRegistered {
            agent_id: agent_id.to_string(),
            strategy: name,
        });
        Ok(())
    }

    /// Remove a strategy by name. Returns `false` when absent.
    pub async fn remove_strategy(&self, agent_id: &str, name: &str) -> bool {
        let mut strategies = self.strategies.write().await;
        let Some(list) = strategies.get_mut(agent_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.name() != name);
        list.len() < before
    }

    /// Register restart, reset and retry, skipping any name already taken.
    pub async fn register_default_strategies(&self, agent_id: &str) {
        let defaults: [Arc<dyn RecoveryStrategy>; 3] = [
            Arc::new(RestartStrategy),
            Arc::new(ResetStrategy),
            Arc::new(RetryStrategy),
        ];
        for strategy in defaults {
            if let Err(e) = self.register_strategy(agent_id, strategy).await {
                debug!(agent_id = %agent_id, error = %e, "Default strategy skipped");
            }
        }
    }

    /// Strategy names for an agent in execution order.
    pub async fn strategies(&self, agent_id: &str) -> Vec<String> {
        self.strategies
            .read()
            .await
            .get(agent_id)
            .map(|l| l.iter().map(|s| s.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Try the agent's strategies in priority order until one succeeds.
    ///
    /// Fails with [`ConductorError::State`] if the state manager has no state
    /// for the agent. `Ok(false)` means no strategy both applied and
    /// succeeded.
    pub async fn recover(
        &self,
        agent_id: &str,
        state_manager: &dyn StateManager,
    ) -> ConductorResult<bool> {
        let state = state_manager.get_state(agent_id).await.ok_or_else(|| {
            ConductorError::State(format!("no state recorded for agent {agent_id}"))
        })?;

        let attempt = {
            let mut recoveries = self.recoveries.write().await;
            let count = recoveries.entry(agent_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let ctx = RecoveryContext {
            agent_id: agent_id.to_string(),
            error: state.last_error.clone(),
            state,
            attempt,
            timestamp: Utc::now(),
        };
        let strategies: Vec<Arc<dyn RecoveryStrategy>> = self
            .strategies
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_default();

        info!(agent_id = %agent_id, attempt, error = ?ctx.error, "Starting recovery");
        for strategy in strategies {
            if !strategy.applies_to(&ctx) {
                continue;
            }
            let name = strategy.name().to_string();
            let started = Instant::now();
            let result = match strategy.recover(&ctx).await {
                Ok(outcome) => match outcome.new_state {
                    Some(new_state) => state_manager
                        .set_state(agent_id, new_state, &format!("recovery:{name}"))
                        .await
                        .map(|()| outcome.retry),
                    None => Ok(outcome.retry),
                },
                Err(e) => Err(e),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(retry) => {
                    self.record(agent_id, &name, true, retry, duration_ms, None)
                        .await;
                    info!(agent_id = %agent_id, strategy = %name, retry, duration_ms, "Agent recovered");
                    self.events.publish(RecoveryEvent::Recovered {
                        agent_id: agent_id.to_string(),
                        strategy: name,
                        retry,
                    });
                    return Ok(true);
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, strategy = %name, error = %e, "Recovery strategy failed");
                    self.record(agent_id, &name, false, false, duration_ms, Some(e.to_string()))
                        .await;
                    self.events.publish(RecoveryEvent::StrategyFailed {
                        agent_id: agent_id.to_string(),
                        strategy: name,
                        error: e.to_string(),
                    });
                }
            }
        }

        warn!(agent_id = %agent_id, "No recovery strategy succeeded");
        self.events.publish(RecoveryEvent::RecoveryExhausted {
            agent_id: agent_id.to_string(),
        });
        Ok(false)
    }

    /// Retained attempts for an agent, oldest first.
    pub async fn attempts(&self, agent_id: &str) -> Vec<RecoveryAttempt> {
        self.attempts
            .read()
            .await
            .get(agent_id)
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate over one agent's retained attempts, or all agents'.
    pub async fn statistics(&self, agent_id: Option<&str>) -> RecoveryStats {
        let attempts = self.attempts.read().await;
        let selected: Vec<&RecoveryAttempt> = match agent_id {
            Some(id) => attempts.get(id).map(|a| a.iter().collect()).unwrap_or_default(),
            None => attempts.values().flat_map(|a| a.iter()).collect(),
        };
        if selected.is_empty() {
            return RecoveryStats::default();
        }

        let total = selected.len();
        let successful = selected.iter().filter(|a| a.success).count();
        let total_ms: u64 = selected.iter().map(|a| a.duration_ms).sum();
        RecoveryStats {
            total_attempts: total,
            successful,
            failed: total - successful,
            success_rate: successful as f64 / total as f64,
            average_duration_ms: total_ms as f64 / total as f64,
        }
    }

    async fn record(
        &self,
        agent_id: &str,
        strategy: &str,
        success: bool,
        retry: bool,
        duration_ms: u64,
        error: Option<String>,
    ) {
        {
            let mut attempts = self.attempts.write().await;
            let list = attempts.entry(agent_id.to_string()).or_default();
            list.push_back(RecoveryAttempt {
                id: Uuid::new_v4(),
                agent_id: agent_id.to_string(),
                strategy: strategy.to_string(),
                success,
                retry,
                duration_ms,
                error,
                at: Utc::now(),
            });
            while list.len() > self.config.max_attempt_history {
                list.pop_front();
            }
        }
        self.monitoring
            .record_metric(
                agent_id,
                Metric::new("recovery_attempt", duration_ms as f64, "ms")
                    .with_meta("strategy", strategy)
                    .with_meta("success", success),
            )
            .await;
    }
}
