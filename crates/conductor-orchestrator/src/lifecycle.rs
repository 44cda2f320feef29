use crate::config::LifecycleConfig;
use crate::events::EventBus;
use chrono::{DateTime, Utc};
use conductor_core::{
    Alert, AlertManager, AlertSeverity, AgentRegistry, ConductorError, Metric, MonitoringService,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "AgentLifecycleManager";

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Never initialized.
    Unknown,
    /// Initialize hook in progress.
    Initializing,
    /// Initialized and accepting work.
    Running,
    /// Paused by request; resumes to `Running`.
    Paused,
    /// Shutdown hook in progress.
    ShuttingDown,
    /// Shut down; may be initialized again.
    Shutdown,
    /// A hook failed or timed out. Leave through restart or recovery.
    Error,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Unknown => "unknown",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Shutdown => "shutdown",
            LifecycleState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// State before the change.
    pub from: LifecycleState,
    /// State after the change.
    pub to: LifecycleState,
    /// Time of the change.
    pub at: DateTime<Utc>,
    /// Why the change happened, when not a plain request.
    pub reason: Option<String>,
}

/// Counters kept per agent across its lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleMetrics {
    /// Duration of the last successful initialize.
    pub init_time_ms: Option<u64>,
    /// Uptime at the last shutdown.
    pub uptime_ms: Option<u64>,
    /// Tasks finished through the engine's queue.
    pub task_count: u64,
    /// Failed lifecycle operations plus failed or timed-out tasks.
    pub error_count: u64,
    /// Completed restarts.
    pub restart_count: u32,
}

/// Lifecycle record of one agent. Never deleted once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLifecycle {
    /// Record id.
    pub id: Uuid,
    /// Agent the record belongs to.
    pub agent_id: String,
    /// Current state.
    pub state: LifecycleState,
    /// Creation time of the record.
    pub created_at: DateTime<Utc>,
    /// Last successful initialize.
    pub initialized_at: Option<DateTime<Utc>>,
    /// Start of the current uptime window.
    pub started_at: Option<DateTime<Utc>>,
    /// Last pause.
    pub paused_at: Option<DateTime<Utc>>,
    /// Last resume.
    pub resumed_at: Option<DateTime<Utc>>,
    /// Last shutdown.
    pub shutdown_at: Option<DateTime<Utc>>,
    /// Last move into `Error`.
    pub error_at: Option<DateTime<Utc>>,
    /// Text of the most recent failure; cleared on success.
    pub last_error: Option<String>,
    /// Counters.
    pub metrics: LifecycleMetrics,
    /// Most recent transitions, oldest first.
    pub history: VecDeque<StateTransition>,
}

impl AgentLifecycle {
    fn new(agent_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            state: LifecycleState::Unknown,
            created_at: Utc::now(),
            initialized_at: None,
            started_at: None,
            paused_at: None,
            resumed_at: None,
            shutdown_at: None,
            error_at: None,
            last_error: None,
            metrics: LifecycleMetrics::default(),
            history: VecDeque::new(),
        }
    }

    fn uptime_ms(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Notifications published by the lifecycle manager.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The agent moved between states.
    StateChanged {
        /// Agent that changed state.
        agent_id: String,
        /// Previous state.
        from: LifecycleState,
        /// New state.
        to: LifecycleState,
        /// Time of the change.
        at: DateTime<Utc>,
    },
    /// Shutdown timed out and the agent was forced into `Shutdown`.
    ShutdownForced {
        /// Agent that was forced down.
        agent_id: String,
    },
}

/// Drives each agent through its lifecycle state machine.
///
/// Public operations return `bool`: every failure is logged, metered and
/// alerted here and never propagated to the caller.
pub struct AgentLifecycleManager {
    config: LifecycleConfig,
    registry: Arc<dyn AgentRegistry>,
    monitoring: Arc<dyn MonitoringService>,
    alerts: Arc<dyn AlertManager>,
    lifecycles: RwLock<HashMap<String, AgentLifecycle>>,
    active: RwLock<HashSet<String>>,
    events: EventBus<LifecycleEvent>,
}

impl AgentLifecycleManager {
    /// Manager with no lifecycle records.
    pub fn new(
        config: LifecycleConfig,
        registry: Arc<dyn AgentRegistry>,
        monitoring: Arc<dyn MonitoringService>,
        alerts: Arc<dyn AlertManager>,
    ) -> Self {
        Self {
            config,
            registry,
            monitoring,
            alerts,
            lifecycles: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            events: EventBus::default(),
        }
    }

    /// Receive state changes and forced shutdowns.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Initialize an agent. Succeeds immediately if it is already running.
    pub async fn initialize_agent(
        &self,
        agent_id: &str,
        config: Option<serde_json::Value>,
    ) -> bool {
        if self.agent_state(agent_id).await == LifecycleState::Running {
            debug!(agent_id = %agent_id, "Agent already running, skipping initialization");
            return true;
        }

        let Some(agent) = self.registry.get_agent(agent_id).await else {
            error!(agent_id = %agent_id, "Cannot initialize unknown agent");
            self.meter(agent_id, "initialize", "agent_not_found").await;
            self.alert(
                AlertSeverity::Medium,
                agent_id,
                "initialize",
                format!("Agent {agent_id} is not registered"),
            )
            .await;
            return false;
        };

        if let Err(current) = self
            .begin(
                agent_id,
                &[LifecycleState::Unknown, LifecycleState::Shutdown],
                LifecycleState::Initializing,
            )
            .await
        {
            warn!(agent_id = %agent_id, state = %current, "Initialization not allowed from current state");
            self.refuse(agent_id, "initialize", current).await;
            return false;
        }

        info!(agent_id = %agent_id, "Initializing agent");
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.init_timeout(), agent.initialize(config.as_ref()))
                .await;

        match outcome {
            Ok(Ok(())) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                {
                    let mut lifecycles = self.lifecycles.write().await;
                    if let Some(record) = lifecycles.get_mut(agent_id) {
                        let now = Utc::now();
                        record.initialized_at = Some(now);
                        record.started_at = Some(now);
                        record.metrics.init_time_ms = Some(elapsed_ms);
                        record.last_error = None;
                    }
                }
                self.transition(agent_id, LifecycleState::Running, None).await;
                self.active.write().await.insert(agent_id.to_string());
                self.monitoring
                    .record_metric(
                        agent_id,
                        Metric::new("initialization_time", elapsed_ms as f64, "ms"),
                    )
                    .await;
                info!(agent_id = %agent_id, init_ms = elapsed_ms, "Agent initialized");
                true
            }
            Ok(Err(e)) => {
                self.fail(agent_id, "initialize", &e).await;
                false
            }
            Err(_) => {
                let e = ConductorError::Timeout(format!(
                    "initialization exceeded {}ms",
                    self.config.init_timeout_ms
                ));
                self.fail(agent_id, "initialize", &e).await;
                false
            }
        }
    }

    /// Shut an agent down. Already shut down or failed agents are a no-op.
    ///
    /// A shutdown hook that overruns its budget forces the agent into
    /// `Shutdown` anyway, but the call still reports failure.
    pub async fn shutdown_agent(&self, agent_id: &str) -> bool {
        match self.agent_state(agent_id).await {
            LifecycleState::Shutdown | LifecycleState::Error => return true,
            LifecycleState::Unknown => {
                warn!(agent_id = %agent_id, "Cannot shut down an agent that was never initialized");
                self.refuse(agent_id, "shutdown", LifecycleState::Unknown).await;
                return false;
            }
            _ => {}
        }

        if let Err(current) = self
            .begin(
                agent_id,
                &[LifecycleState::Running, LifecycleState::Paused],
                LifecycleState::ShuttingDown,
            )
            .await
        {
            warn!(agent_id = %agent_id, state = %current, "Shutdown not allowed from current state");
            self.refuse(agent_id, "shutdown", current).await;
            return false;
        }

        info!(agent_id = %agent_id, "Shutting down agent");
        let outcome = match self.registry.get_agent(agent_id).await {
            Some(agent) => {
                tokio::time::timeout(self.config.shutdown_timeout(), agent.shutdown()).await
            }
            None => Ok(Ok(())),
        };

        match outcome {
            Ok(Ok(())) => {
                self.record_uptime(agent_id).await;
                self.transition(agent_id, LifecycleState::Shutdown, None).await;
                self.active.write().await.remove(agent_id);
                info!(agent_id = %agent_id, "Agent shut down");
                true
            }
            Ok(Err(e)) => {
                self.active.write().await.remove(agent_id);
                self.fail(agent_id, "shutdown", &e).await;
                false
            }
            Err(_) => {
                warn!(agent_id = %agent_id, "Shutdown timed out, forcing shutdown state");
                self.record_uptime(agent_id).await;
                self.transition(
                    agent_id,
                    LifecycleState::Shutdown,
                    Some("forced after shutdown timeout".into()),
                )
                .await;
                self.active.write().await.remove(agent_id);
                self.meter(agent_id, "shutdown", "timeout").await;
                self.alerts
                    .create_alert(
                        Alert::new(
                            AlertSeverity::High,
                            format!(
                                "Agent {agent_id} did not shut down within {}ms",
                                self.config.shutdown_timeout_ms
                            ),
                        )
                        .with_meta("agent_id", agent_id)
                        .with_meta("component", COMPONENT),
                    )
                    .await;
                self.events.publish(LifecycleEvent::ShutdownForced {
                    agent_id: agent_id.to_string(),
                });
                false
            }
        }
    }

    /// Shut down, wait the configured delay, then initialize again.
    ///
    /// This is also the only way out of `Error`.
    pub async fn restart_agent(&self, agent_id: &str, config: Option<serde_json::Value>) -> bool {
        info!(agent_id = %agent_id, "Restarting agent");
        if self.agent_state(agent_id).await == LifecycleState::Error {
            self.transition(
                agent_id,
                LifecycleState::Shutdown,
                Some("restart from error".into()),
            )
            .await;
        } else if !self.shutdown_agent(agent_id).await {
            warn!(agent_id = %agent_id, "Restart aborted: shutdown failed");
            return false;
        }

        tokio::time::sleep(self.config.restart_delay()).await;

        if let Some(record) = self.lifecycles.write().await.get_mut(agent_id) {
            record.metrics.restart_count += 1;
        }
        self.initialize_agent(agent_id, config).await
    }

    /// Pause a running agent.
    pub async fn pause_agent(&self, agent_id: &str) -> bool {
        self.toggle(agent_id, LifecycleState::Running, LifecycleState::Paused)
            .await
    }

    /// Resume a paused agent.
    pub async fn resume_agent(&self, agent_id: &str) -> bool {
        self.toggle(agent_id, LifecycleState::Paused, LifecycleState::Running)
            .await
    }

    /// Bring a failed agent back to `Running` after an external recovery.
    pub async fn mark_recovered(&self, agent_id: &str) -> bool {
        if let Err(current) = self
            .begin(agent_id, &[LifecycleState::Error], LifecycleState::Running)
            .await
        {
            debug!(agent_id = %agent_id, state = %current, "Agent is not in error state");
            return false;
        }
        if let Some(record) = self.lifecycles.write().await.get_mut(agent_id) {
            record.last_error = None;
            record.started_at = Some(Utc::now());
        }
        self.active.write().await.insert(agent_id.to_string());
        info!(agent_id = %agent_id, "Agent recovered");
        true
    }

    /// Count one finished task against the agent's lifecycle metrics.
    pub async fn record_task_outcome(&self, agent_id: &str, success: bool) {
        if let Some(record) = self.lifecycles.write().await.get_mut(agent_id) {
            record.metrics.task_count += 1;
            if !success {
                record.metrics.error_count += 1;
            }
        }
    }

    /// Current state; `Unknown` for agents never seen.
    pub async fn agent_state(&self, agent_id: &str) -> LifecycleState {
        self.lifecycles
            .read()
            .await
            .get(agent_id)
            .map_or(LifecycleState::Unknown, |r| r.state)
    }

    /// Snapshot of an agent's lifecycle record.
    pub async fn lifecycle(&self, agent_id: &str) -> Option<AgentLifecycle> {
        self.lifecycles.read().await.get(agent_id).cloned()
    }

    /// Every lifecycle record, oldest first.
    pub async fn all_lifecycles(&self) -> Vec<AgentLifecycle> {
        let mut all: Vec<AgentLifecycle> = self.lifecycles.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    /// Agents currently running or paused, sorted.
    pub async fn active_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the agent is in the active set.
    pub async fn is_active(&self, agent_id: &str) -> bool {
        self.active.read().await.contains(agent_id)
    }

    /// Agents in `state`, sorted.
    pub async fn agents_in_state(&self, state: LifecycleState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lifecycles
            .read()
            .await
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of records per state.
    pub async fn count_by_state(&self) -> HashMap<LifecycleState, usize> {
        let mut counts = HashMap::new();
        for record in self.lifecycles.read().await.values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        counts
    }

    async fn toggle(&self, agent_id: &str, from: LifecycleState, to: LifecycleState) -> bool {
        let operation = if to == LifecycleState::Paused { "pause" } else { "resume" };
        let current = self.agent_state(agent_id).await;
        if current != from {
            warn!(agent_id = %agent_id, state = %current, target = %to, "Invalid lifecycle transition");
            self.refuse(agent_id, operation, current).await;
            return false;
        }

        let hook = match self.registry.get_agent(agent_id).await {
            Some(agent) if to == LifecycleState::Paused => agent.pause().await,
            Some(agent) => agent.resume().await,
            None => Ok(()),
        };

        if let Err(e) = hook {
            error!(agent_id = %agent_id, operation, error = %e, "Lifecycle hook failed");
            self.meter(agent_id, operation, e.kind()).await;
            self.alert(
                AlertSeverity::Medium,
                agent_id,
                operation,
                format!("Agent {agent_id} failed to {operation}: {e}"),
            )
            .await;
            return false;
        }

        if self.begin(agent_id, &[from], to).await.is_err() {
            return false;
        }
        if let Some(record) = self.lifecycles.write().await.get_mut(agent_id) {
            if to == LifecycleState::Paused {
                record.paused_at = Some(Utc::now());
            } else {
                record.resumed_at = Some(Utc::now());
            }
        }
        info!(agent_id = %agent_id, state = %to, "Agent state toggled");
        true
    }

    /// Atomically move from one of `allowed` to `to`, creating the record on
    /// first use. Returns the current state when the move is not allowed.
    async fn begin(
        &self,
        agent_id: &str,
        allowed: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), LifecycleState> {
        let event = {
            let mut lifecycles = self.lifecycles.write().await;
            let record = lifecycles
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentLifecycle::new(agent_id));
            if !allowed.contains(&record.state) {
                return Err(record.state);
            }
            self.apply(record, to, None)
        };
        self.events.publish(event);
        Ok(())
    }

    async fn transition(&self, agent_id: &str, to: LifecycleState, reason: Option<String>) {
        let event = {
            let mut lifecycles = self.lifecycles.write().await;
            let Some(record) = lifecycles.get_mut(agent_id) else {
                return;
            };
            self.apply(record, to, reason)
        };
        self.events.publish(event);
    }

    fn apply(
        &self,
        record: &mut AgentLifecycle,
        to: LifecycleState,
        reason: Option<String>,
    ) -> LifecycleEvent {
        let now = Utc::now();
        let from = record.state;
        record.state = to;
        match to {
            LifecycleState::Shutdown => record.shutdown_at = Some(now),
            LifecycleState::Error => record.error_at = Some(now),
            _ => {}
        }
        record.history.push_back(StateTransition {
            from,
            to,
            at: now,
            reason,
        });
        while record.history.len() > self.config.history_limit {
            record.history.pop_front();
        }
        debug!(agent_id = %record.agent_id, from = %from, to = %to, "Lifecycle transition");
        LifecycleEvent::StateChanged {
            agent_id: record.agent_id.clone(),
            from,
            to,
            at: now,
        }
    }

    async fn fail(&self, agent_id: &str, operation: &str, err: &ConductorError) {
        error!(agent_id = %agent_id, operation, error = %err, "Agent lifecycle operation failed");
        if let Some(record) = self.lifecycles.write().await.get_mut(agent_id) {
            record.last_error = Some(err.to_string());
            record.metrics.error_count += 1;
        }
        self.transition(agent_id, LifecycleState::Error, Some(err.to_string()))
            .await;
        self.meter(agent_id, operation, err.kind()).await;
        self.alert(
            AlertSeverity::High,
            agent_id,
            operation,
            format!("Agent {agent_id} failed to {operation}: {err}"),
        )
        .await;
    }

    async fn record_uptime(&self, agent_id: &str) {
        let uptime = {
            let mut lifecycles = self.lifecycles.write().await;
            let Some(record) = lifecycles.get_mut(agent_id) else {
                return;
            };
            let uptime = record.uptime_ms(Utc::now());
            record.metrics.uptime_ms = Some(uptime);
            uptime
        };
        self.monitoring
            .record_metric(agent_id, Metric::new("uptime", uptime as f64, "ms"))
            .await;
    }

    /// Meter and alert an operation refused by the state machine.
    async fn refuse(&self, agent_id: &str, operation: &str, current: LifecycleState) {
        self.meter(agent_id, operation, "invalid_transition").await;
        self.alert(
            AlertSeverity::Low,
            agent_id,
            operation,
            format!("Agent {agent_id} cannot {operation} while {current}"),
        )
        .await;
    }

    async fn alert(
        &self,
        severity: AlertSeverity,
        agent_id: &str,
        operation: &str,
        message: String,
    ) {
        self.alerts
            .create_alert(
                Alert::new(severity, message)
                    .with_meta("agent_id", agent_id)
                    .with_meta("component", COMPONENT)
                    .with_meta("operation", operation),
            )
            .await;
    }

    async fn meter(&self, agent_id: &str, operation: &str, kind: &str) {
        self.monitoring
            .record_metric(
                agent_id,
                Metric::count("lifecycle_error")
                    .with_meta("operation", operation)
                    .with_meta("kind", kind),
            )
            .await;
    }
}
