use crate::bus::CommunicationBus;
use crate::config::ConductorConfig;
use crate::lifecycle::AgentLifecycleManager;
use crate::prioritizer::TaskPrioritizer;
use crate::recovery::ErrorRecovery;
use crate::scheduler::{TaskScheduler, TaskSink};
use crate::task_queue::{QueueEvent, TaskQueue};
use conductor_core::{
    AgentRegistry, AlertManager, ConductorResult, ErrorHandler, InMemoryMonitoring,
    InMemoryStateManager, MonitoringService, StateManager, Task, TracingErrorHandler,
};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Host-supplied services the engine components call out to.
#[derive(Clone)]
pub struct Collaborators {
    /// Agent lookup.
    pub registry: Arc<dyn AgentRegistry>,
    /// Metric sink.
    pub monitoring: Arc<dyn MonitoringService>,
    /// Alert sink.
    pub alerts: Arc<dyn AlertManager>,
    /// Agent state store used by recovery.
    pub state_manager: Arc<dyn StateManager>,
    /// Receives task and schedule failures.
    pub error_handler: Arc<dyn ErrorHandler>,
}

impl Collaborators {
    /// In-process monitoring, state and logging around the given registry.
    pub fn in_memory(registry: Arc<dyn AgentRegistry>) -> Self {
        let monitoring = Arc::new(InMemoryMonitoring::new());
        Self {
            registry,
            monitoring: monitoring.clone(),
            alerts: monitoring,
            state_manager: Arc::new(InMemoryStateManager::new()),
            error_handler: Arc::new(TracingErrorHandler),
        }
    }
}

/// All six components built from one configuration and wired together.
///
/// Scheduled work flows into the task queue, and queue outcomes are counted
/// against each agent's lifecycle metrics while the engine runs.
pub struct ConductorEngine {
    config: ConductorConfig,
    lifecycle: Arc<AgentLifecycleManager>,
    prioritizer: Arc<TaskPrioritizer>,
    queue: Arc<TaskQueue>,
    scheduler: TaskScheduler,
    bus: CommunicationBus,
    recovery: ErrorRecovery,
    state_manager: Arc<dyn StateManager>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ConductorEngine {
    /// Validate `config` and build every component around `collaborators`.
    pub fn new(config: ConductorConfig, collaborators: Collaborators) -> ConductorResult<Self> {
        config.validate()?;
        let Collaborators {
            registry,
            monitoring,
            alerts,
            state_manager,
            error_handler,
        } = collaborators;

        let lifecycle = Arc::new(AgentLifecycleManager::new(
            config.lifecycle.clone(),
            registry.clone(),
            monitoring.clone(),
            alerts,
        ));
        let prioritizer = Arc::new(TaskPrioritizer::new(config.prioritizer.clone()));
        let queue = Arc::new(TaskQueue::with_prioritizer(
            config.queue.clone(),
            registry.clone(),
            monitoring.clone(),
            error_handler.clone(),
            prioritizer.clone(),
        ));
        let sink: Arc<dyn TaskSink> = queue.clone();
        let scheduler = TaskScheduler::new(config.scheduler.clone(), sink, error_handler);
        let bus = CommunicationBus::new(config.bus.clone(), registry, monitoring.clone());
        let recovery = ErrorRecovery::new(config.recovery.clone(), monitoring);

        Ok(Self {
            config,
            lifecycle,
            prioritizer,
            queue,
            scheduler,
            bus,
            recovery,
            state_manager,
            forwarder: Mutex::new(None),
        })
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// Agent lifecycle manager.
    pub fn lifecycle(&self) -> &AgentLifecycleManager {
        &self.lifecycle
    }

    /// Prioritizer scoring queued tasks.
    pub fn prioritizer(&self) -> &TaskPrioritizer {
        &self.prioritizer
    }

    /// Task queue.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Task scheduler feeding the queue.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Communication bus.
    pub fn bus(&self) -> &CommunicationBus {
        &self.bus
    }

    /// Error recovery.
    pub fn recovery(&self) -> &ErrorRecovery {
        &self.recovery
    }

    /// Enqueue a task for immediate execution.
    pub async fn submit_task(&self, task: Task) -> ConductorResult<Uuid> {
        self.queue.enqueue_task(task).await
    }

    /// Start queue polling, scheduling and lifecycle bookkeeping.
    pub async fn start(&self) {
        let mut forwarder = self.forwarder.lock().await;
        if forwarder.is_none() {
            let events = self.queue.subscribe();
            let lifecycle = Arc::clone(&self.lifecycle);
            *forwarder = Some(tokio::spawn(forward_outcomes(events, lifecycle)));
        }
        drop(forwarder);

        self.queue.start().await;
        self.scheduler.start().await;
        info!("Conductor engine started");
    }

    /// Stop scheduling and polling. In-flight executions still finish.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.queue.stop().await;
        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
        }
        info!("Conductor engine stopped");
    }

    /// Run the agent's recovery strategies and, on success, move a failed
    /// agent back to `Running`.
    pub async fn recover_agent(&self, agent_id: &str) -> ConductorResult<bool> {
        let recovered = self
            .recovery
            .recover(agent_id, self.state_manager.as_ref())
            .await?;
        if recovered && !self.lifecycle.mark_recovered(agent_id).await {
            info!(agent_id = %agent_id, "Recovered agent was not in error state");
        }
        Ok(recovered)
    }
}

impl Drop for ConductorEngine {
    fn drop(&mut self) {
        if let Ok(mut forwarder) = self.forwarder.try_lock() {
            if let Some(handle) = forwarder.take() {
                handle.abort();
            }
        }
    }
}

async fn forward_outcomes(
    mut events: broadcast::Receiver<QueueEvent>,
    lifecycle: Arc<AgentLifecycleManager>,
) {
    loop {
        let (agent_id, success) = match events.recv().await {
            Ok(QueueEvent::TaskCompleted { execution }) => (execution.task.agent_id, true),
            Ok(QueueEvent::TaskFailed { execution } | QueueEvent::TaskTimedOut { execution }) => {
                (execution.task.agent_id, false)
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Lifecycle bookkeeping fell behind queue events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        lifecycle.record_task_outcome(&agent_id, success).await;
    }
}
