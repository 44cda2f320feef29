use crate::config::QueueConfig;
use crate::events::EventBus;
use crate::prioritizer::{PriorityContext, TaskPrioritizer};
use crate::scheduler::TaskSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    Agent, AgentRegistry, ConductorError, ConductorResult, ErrorContext, ErrorHandler, Metric,
    MonitoringService, Task, TaskStatus,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "TaskQueue";

/// Runtime record of a task actually running against its agent.
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecution {
    /// Execution record id.
    pub id: Uuid,
    /// The task, with its status kept in step with `status`.
    pub task: Task,
    /// `Running` until the execution finishes.
    pub status: TaskStatus,
    /// Start of execution.
    pub started_at: DateTime<Utc>,
    /// End of execution.
    pub completed_at: Option<DateTime<Utc>>,
    /// Agent result on success.
    pub result: Option<serde_json::Value>,
    /// Failure text on error or timeout.
    pub error: Option<String>,
}

impl TaskExecution {
    fn start(mut task: Task) -> Self {
        task.status = TaskStatus::Running;
        Self {
            id: Uuid::new_v4(),
            task,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }

    fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.task.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Notifications published by the task queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A task joined its agent's backlog.
    TaskEnqueued {
        /// Enqueued task.
        task_id: Uuid,
        /// Owning agent.
        agent_id: String,
    },
    /// A task left the backlog and started executing.
    TaskStarted {
        /// Execution record id.
        execution_id: Uuid,
        /// Started task.
        task_id: Uuid,
        /// Executing agent.
        agent_id: String,
    },
    /// The agent returned a result.
    TaskCompleted {
        /// Finished execution.
        execution: TaskExecution,
    },
    /// The agent returned an error.
    TaskFailed {
        /// Finished execution.
        execution: TaskExecution,
    },
    /// The execution budget ran out.
    TaskTimedOut {
        /// Finished execution.
        execution: TaskExecution,
    },
    /// A queued or running task was canceled.
    TaskCanceled {
        /// Canceled task.
        task_id: Uuid,
        /// Owning agent.
        agent_id: String,
    },
}

/// Per-status counts over backlogs, active executions and ledgers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting in backlogs.
    pub queued: usize,
    /// Executions in flight.
    pub running: usize,
    /// Completed executions in the ledgers.
    pub completed: usize,
    /// Failed executions in the ledgers.
    pub failed: usize,
    /// Timed-out executions in the ledgers.
    pub timed_out: usize,
    /// Canceled executions in the ledgers.
    pub canceled: usize,
}

struct QueuedTask {
    task: Task,
    seq: u64,
    /// Latest prioritizer score; refreshed while the task waits.
    scored: Option<u8>,
}

struct QueueState {
    config: QueueConfig,
    queues: HashMap<String, Vec<QueuedTask>>,
    active: HashMap<String, TaskExecution>,
    completed: HashMap<String, VecDeque<TaskExecution>>,
    priorities: HashMap<String, u8>,
    next_seq: u64,
}

impl QueueState {
    /// Explicit and type-table priorities take precedence over scoring.
    fn is_pinned(&self, task: &Task) -> bool {
        task.priority.is_some() || self.priorities.contains_key(&task.task_type)
    }

    fn effective_priority(&self, queued: &QueuedTask) -> u8 {
        queued
            .task
            .priority
            .or_else(|| self.priorities.get(&queued.task.task_type).copied())
            .or(queued.scored)
            .unwrap_or(self.config.default_priority)
    }

    fn sort_queue(&mut self, agent_id: &str) {
        let Some(mut queue) = self.queues.remove(agent_id) else {
            return;
        };
        queue.sort_by(|a, b| {
            self.effective_priority(b)
                .cmp(&self.effective_priority(a))
                .then(a.seq.cmp(&b.seq))
        });
        self.queues.insert(agent_id.to_string(), queue);
    }

    fn sort_all(&mut self) {
        let agents: Vec<String> = self.queues.keys().cloned().collect();
        for agent_id in agents {
            self.sort_queue(&agent_id);
        }
    }

    fn push_completed(&mut self, execution: TaskExecution) {
        let limit = self.config.max_completed;
        let ledger = self
            .completed
            .entry(execution.task.agent_id.clone())
            .or_default();
        ledger.push_back(execution);
        while ledger.len() > limit {
            ledger.pop_front();
        }
    }
}

struct Inner {
    state: RwLock<QueueState>,
    registry: Arc<dyn AgentRegistry>,
    monitoring: Arc<dyn MonitoringService>,
    error_handler: Arc<dyn ErrorHandler>,
    prioritizer: Option<Arc<TaskPrioritizer>>,
    events: EventBus<QueueEvent>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Per-agent task backlogs with priority ordering and a polling executor.
///
/// At most one execution per agent is in flight; agents run independently of
/// each other. Nothing executes until [`TaskQueue::start`] is called.
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Queue with no prioritizer; unprioritized tasks use the configured default.
    pub fn new(
        config: QueueConfig,
        registry: Arc<dyn AgentRegistry>,
        monitoring: Arc<dyn MonitoringService>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self::build(config, registry, monitoring, error_handler, None)
    }

    /// Like [`TaskQueue::new`], scoring unprioritized tasks with `prioritizer`.
    pub fn with_prioritizer(
        config: QueueConfig,
        registry: Arc<dyn AgentRegistry>,
        monitoring: Arc<dyn MonitoringService>,
        error_handler: Arc<dyn ErrorHandler>,
        prioritizer: Arc<TaskPrioritizer>,
    ) -> Self {
        Self::build(config, registry, monitoring, error_handler, Some(prioritizer))
    }

    fn build(
        config: QueueConfig,
        registry: Arc<dyn AgentRegistry>,
        monitoring: Arc<dyn MonitoringService>,
        error_handler: Arc<dyn ErrorHandler>,
        prioritizer: Option<Arc<TaskPrioritizer>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(QueueState {
                    config,
                    queues: HashMap::new(),
                    active: HashMap::new(),
                    completed: HashMap::new(),
                    priorities: HashMap::new(),
                    next_seq: 0,
                }),
                registry,
                monitoring,
                error_handler,
                prioritizer,
                events: EventBus::default(),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Receive queue notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Add a task to its agent's backlog. Fails fast when the backlog is full.
    pub async fn enqueue_task(&self, mut task: Task) -> ConductorResult<Uuid> {
        let scored = self.score(&task).await;

        let task_id = task.id;
        let agent_id = task.agent_id.clone();
        {
            let mut state = self.inner.state.write().await;
            let capacity = state.config.max_queue_size;
            let len = state.queues.get(&agent_id).map_or(0, Vec::len);
            if len >= capacity {
                warn!(agent_id = %agent_id, capacity, "Task queue full, rejecting task");
                return Err(ConductorError::Capacity(format!(
                    "queue for agent {agent_id} is full ({capacity} tasks)"
                )));
            }

            task.status = TaskStatus::Pending;
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .queues
                .entry(agent_id.clone())
                .or_default()
                .push(QueuedTask { task, seq, scored });
            state.sort_queue(&agent_id);
        }

        debug!(task_id = %task_id, agent_id = %agent_id, "Task enqueued");
        self.inner
            .events
            .publish(QueueEvent::TaskEnqueued { task_id, agent_id });
        Ok(task_id)
    }

    /// Remove and return the head of an agent's backlog.
    pub async fn dequeue_task(&self, agent_id: &str) -> Option<Task> {
        let mut state = self.inner.state.write().await;
        let queue = state.queues.get_mut(agent_id)?;
        if queue.is_empty() {
            return None;
        }
        Some(queue.remove(0).task)
    }

    /// Cancel a queued or running task.
    ///
    /// A running task only loses its bookkeeping: the agent call itself keeps
    /// going and its eventual result is discarded.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        let canceled = {
            let mut state = self.inner.state.write().await;
            let queued = state.queues.iter_mut().find_map(|(agent_id, queue)| {
                let idx = queue.iter().position(|q| q.task.id == task_id)?;
                queue.remove(idx);
                Some(agent_id.clone())
            });

            match queued {
                Some(agent_id) => Some(agent_id),
                None => {
                    let running = state
                        .active
                        .iter()
                        .find(|(_, e)| e.task.id == task_id)
                        .map(|(agent_id, _)| agent_id.clone());
                    match running.and_then(|agent_id| state.active.remove(&agent_id)) {
                        Some(mut execution) => {
                            execution.finish(TaskStatus::Canceled);
                            let agent_id = execution.task.agent_id.clone();
                            state.push_completed(execution);
                            Some(agent_id)
                        }
                        None => None,
                    }
                }
            }
        };

        match canceled {
            Some(agent_id) => {
                info!(task_id = %task_id, agent_id = %agent_id, "Task canceled");
                self.inner
                    .events
                    .publish(QueueEvent::TaskCanceled { task_id, agent_id });
                true
            }
            None => false,
        }
    }

    /// Set the priority for every task of `task_type` without an explicit
    /// priority, and reorder all backlogs.
    pub async fn set_task_priority(&self, task_type: impl Into<String>, priority: u8) {
        let task_type = task_type.into();
        let mut state = self.inner.state.write().await;
        state.priorities.insert(task_type.clone(), priority);
        state.sort_all();
        info!(task_type = %task_type, priority, "Task type priority set");
    }

    /// Replace the queue settings. A running poll loop restarts with the new
    /// interval.
    pub async fn configure(&self, config: QueueConfig) -> ConductorResult<()> {
        config.validate()?;
        {
            let mut state = self.inner.state.write().await;
            let limit = config.max_completed;
            for ledger in state.completed.values_mut() {
                while ledger.len() > limit {
                    ledger.pop_front();
                }
            }
            state.config = config;
            state.sort_all();
        }
        if self.is_running().await {
            self.stop().await;
            self.start().await;
        }
        Ok(())
    }

    /// Start the poll loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut poller = self.inner.poller.lock().await;
        if poller.is_some() {
            return;
        }
        let interval = self.inner.state.read().await.config.poll_interval();
        let weak = Arc::downgrade(&self.inner);
        *poller = Some(tokio::spawn(poll_loop(weak, interval)));
        info!(interval_ms = interval.as_millis() as u64, "Task queue started");
    }

    /// Stop the poll loop. Running executions still finish and are recorded.
    pub async fn stop(&self) {
        if let Some(handle) = self.inner.poller.lock().await.take() {
            handle.abort();
            info!("Task queue stopped");
        }
    }

    /// Whether the poll loop is running.
    pub async fn is_running(&self) -> bool {
        self.inner.poller.lock().await.is_some()
    }

    /// Backlog of an agent in dequeue order.
    pub async fn queued_tasks(&self, agent_id: &str) -> Vec<Task> {
        self.inner
            .state
            .read()
            .await
            .queues
            .get(agent_id)
            .map(|q| q.iter().map(|queued| queued.task.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of tasks waiting for an agent.
    pub async fn queue_length(&self, agent_id: &str) -> usize {
        self.inner
            .state
            .read()
            .await
            .queues
            .get(agent_id)
            .map_or(0, Vec::len)
    }

    /// The agent's in-flight execution, if any.
    pub async fn active_execution(&self, agent_id: &str) -> Option<TaskExecution> {
        self.inner.state.read().await.active.get(agent_id).cloned()
    }

    /// Every in-flight execution.
    pub async fn active_executions(&self) -> Vec<TaskExecution> {
        self.inner.state.read().await.active.values().cloned().collect()
    }

    /// Finished executions of an agent, oldest first.
    pub async fn completed_executions(&self, agent_id: &str) -> Vec<TaskExecution> {
        self.inner
            .state
            .read()
            .await
            .completed
            .get(agent_id)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Status of a task that is queued, running, or still in a ledger.
    pub async fn task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        let state = self.inner.state.read().await;
        if state
            .queues
            .values()
            .any(|q| q.iter().any(|queued| queued.task.id == task_id))
        {
            return Some(TaskStatus::Pending);
        }
        if state.active.values().any(|e| e.task.id == task_id) {
            return Some(TaskStatus::Running);
        }
        state
            .completed
            .values()
            .flat_map(|l| l.iter())
            .find(|e| e.task.id == task_id)
            .map(|e| e.status)
    }

    /// Per-status counts across all agents.
    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.read().await;
        let mut stats = QueueStats {
            queued: state.queues.values().map(Vec::len).sum(),
            running: state.active.len(),
            ..Default::default()
        };
        for execution in state.completed.values().flat_map(|l| l.iter()) {
            match execution.status {
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Timeout => stats.timed_out += 1,
                TaskStatus::Canceled => stats.canceled += 1,
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }
        stats
    }

    /// Run one admission pass immediately, outside the poll loop.
    pub async fn tick(&self) {
        Arc::clone(&self.inner).process_tick().await;
    }

    async fn score(&self, task: &Task) -> Option<u8> {
        let prioritizer = self.inner.prioritizer.as_ref()?;
        if self.inner.state.read().await.is_pinned(task) {
            return None;
        }
        let ctx = self.inner.priority_context(&task.agent_id).await;
        Some(prioritizer.prioritize_task(task, &ctx).await)
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.inner.poller.try_lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl TaskSink for TaskQueue {
    async fn submit(&self, task: Task) -> ConductorResult<()> {
        self.enqueue_task(task).await.map(|_| ())
    }
}

async fn poll_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.process_tick().await;
    }
}

impl Inner {
    async fn priority_context(&self, agent_id: &str) -> PriorityContext {
        let ctx = {
            let state = self.state.read().await;
            let capacity = state.config.max_queue_size.max(1) as f64;
            let agent_len = state.queues.get(agent_id).map_or(0, Vec::len) as f64;
            let total: usize = state.queues.values().map(Vec::len).sum();
            let queues = state.queues.len().max(1) as f64;
            PriorityContext::new()
                .with_agent_load(agent_len / capacity)
                .with_system_load(total as f64 / (capacity * queues))
        };
        match self.registry.get_agent(agent_id).await {
            Some(agent) => ctx.with_agent_type(agent.agent_type()),
            None => ctx,
        }
    }

    /// Score unpinned backlog tasks again so time spent waiting counts.
    async fn rescore_backlog(&self, agent_id: &str) {
        let Some(prioritizer) = self.prioritizer.as_ref() else {
            return;
        };
        let unpinned: Vec<Task> = {
            let state = self.state.read().await;
            state
                .queues
                .get(agent_id)
                .map(|queue| {
                    queue
                        .iter()
                        .filter(|q| !state.is_pinned(&q.task))
                        .map(|q| q.task.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        if unpinned.is_empty() {
            return;
        }

        let ctx = self.priority_context(agent_id).await;
        let mut scores = HashMap::with_capacity(unpinned.len());
        for task in &unpinned {
            scores.insert(task.id, prioritizer.rescore_task(task, &ctx).await);
        }

        let mut state = self.state.write().await;
        if let Some(queue) = state.queues.get_mut(agent_id) {
            for queued in queue.iter_mut() {
                if let Some(score) = scores.get(&queued.task.id) {
                    queued.scored = Some(*score);
                }
            }
        }
        state.sort_queue(agent_id);
    }

    /// Start the head task of every idle agent with a non-empty backlog.
    async fn process_tick(self: Arc<Self>) {
        let candidates: Vec<String> = {
            let state = self.state.read().await;
            state
                .queues
                .iter()
                .filter(|(agent_id, queue)| {
                    !queue.is_empty() && !state.active.contains_key(agent_id.as_str())
                })
                .map(|(agent_id, _)| agent_id.clone())
                .collect()
        };

        for agent_id in candidates {
            self.rescore_backlog(&agent_id).await;
            let Some(agent) = self.registry.get_agent(&agent_id).await else {
                debug!(agent_id = %agent_id, "Agent not registered, skipping this tick");
                continue;
            };

            let (execution, budget) = {
                let mut state = self.state.write().await;
                if state.active.contains_key(&agent_id) {
                    continue;
                }
                let Some(queue) = state.queues.get_mut(&agent_id) else {
                    continue;
                };
                if queue.is_empty() {
                    continue;
                }
                let execution = TaskExecution::start(queue.remove(0).task);
                let budget = execution
                    .task
                    .timeout()
                    .unwrap_or_else(|| state.config.default_timeout());
                state.active.insert(agent_id.clone(), execution.clone());
                (execution, budget)
            };

            debug!(
                agent_id = %agent_id,
                task_id = %execution.task.id,
                execution_id = %execution.id,
                "Starting task execution"
            );
            self.events.publish(QueueEvent::TaskStarted {
                execution_id: execution.id,
                task_id: execution.task.id,
                agent_id: agent_id.clone(),
            });
            tokio::spawn(Arc::clone(&self).run_execution(agent, execution, budget));
        }
    }

    async fn run_execution(
        self: Arc<Self>,
        agent: Arc<dyn Agent>,
        execution: TaskExecution,
        budget: Duration,
    ) {
        let started = Instant::now();
        let outcome = tokio::time::timeout(budget, agent.execute_task(&execution.task)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, result, failure) = match outcome {
            Ok(Ok(value)) => (TaskStatus::Completed, Some(value), None),
            Ok(Err(e)) => (TaskStatus::Failed, None, Some(e)),
            Err(_) => (
                TaskStatus::Timeout,
                None,
                Some(ConductorError::Timeout(format!(
                    "task {} exceeded {}ms",
                    execution.task.id,
                    budget.as_millis()
                ))),
            ),
        };

        let agent_id = execution.task.agent_id.clone();
        let finished = {
            let mut state = self.state.write().await;
            let current = state
                .active
                .get(&agent_id)
                .is_some_and(|active| active.id == execution.id);
            if !current {
                debug!(
                    agent_id = %agent_id,
                    execution_id = %execution.id,
                    "Execution no longer tracked, discarding result"
                );
                return;
            }
            let Some(mut finished) = state.active.remove(&agent_id) else {
                return;
            };
            finished.finish(status);
            finished.result = result;
            finished.error = failure.as_ref().map(ToString::to_string);
            state.push_completed(finished.clone());
            finished
        };

        self.monitoring
            .record_metric(
                &agent_id,
                Metric::new("task_duration", duration_ms as f64, "ms")
                    .with_meta("status", status.to_string())
                    .with_meta("task_type", finished.task.task_type.clone()),
            )
            .await;
        self.monitoring
            .record_metric(&agent_id, Metric::count(format!("task_{status}")))
            .await;

        match failure {
            None => {
                debug!(agent_id = %agent_id, task_id = %finished.task.id, duration_ms, "Task completed");
                self.events
                    .publish(QueueEvent::TaskCompleted { execution: finished });
            }
            Some(err) => {
                error!(
                    agent_id = %agent_id,
                    task_id = %finished.task.id,
                    status = %status,
                    error = %err,
                    "Task execution failed"
                );
                self.error_handler
                    .handle_error(
                        &err,
                        ErrorContext::new(&agent_id, COMPONENT, "execute_task")
                            .with_correlation(finished.task.id),
                    )
                    .await;
                let event = if status == TaskStatus::Timeout {
                    QueueEvent::TaskTimedOut { execution: finished }
                } else {
                    QueueEvent::TaskFailed { execution: finished }
                };
                self.events.publish(event);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::PrioritizerConfig;
    use conductor_core::{InMemoryAgentRegistry, InMemoryMonitoring};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Agent that sleeps for `delay`, tracks concurrency and fails on demand.
    struct WorkAgent {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        runs: AtomicUsize,
    }

    impl WorkAgent {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Agent for WorkAgent {
        fn agent_type(&self) -> &str {
            "worker"
        }

        async fn execute_task(&self, task: &Task) -> ConductorResult<serde_json::Value> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            if task.task_type == "explode" {
                return Err(ConductorError::Execution("kaboom".into()));
            }
            Ok(serde_json::json!({"done": task.task_type}))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: std::sync::Mutex<Vec<(String, ErrorContext)>>,
    }

    #[async_trait]
    impl ErrorHandler for RecordingHandler {
        async fn handle_error(&self, error: &ConductorError, context: ErrorContext) {
            self.calls
                .lock()
                .unwrap()
                .push((error.kind().to_string(), context));
        }
    }

    struct Fixture {
        queue: TaskQueue,
        agent: Arc<WorkAgent>,
        handler: Arc<RecordingHandler>,
        monitoring: Arc<InMemoryMonitoring>,
        registry: Arc<InMemoryAgentRegistry>,
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            poll_interval_ms: 10,
            default_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    async fn fixture(config: QueueConfig, delay: Duration) -> Fixture {
        let agent = WorkAgent::new(delay);
        let registry = Arc::new(InMemoryAgentRegistry::new());
        registry.register("a1", agent.clone()).await;
        let monitoring = Arc::new(InMemoryMonitoring::new());
        let handler = Arc::new(RecordingHandler::default());
        let queue = TaskQueue::new(config, registry.clone(), monitoring.clone(), handler.clone());
        Fixture {
            queue,
            agent,
            handler,
            monitoring,
            registry,
        }
    }

    async fn wait_for_completed(queue: &TaskQueue, agent_id: &str, n: usize) {
        for _ in 0..300 {
            if queue.completed_executions(agent_id).await.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {n} completed executions on {agent_id}");
    }

    fn task(task_type: &str) -> Task {
        Task::new("a1", task_type, serde_json::Value::Null)
    }

    #[tokio::test]
    async fn test_priority_desc_ties_fifo() {
        let f = fixture(fast_config(), Duration::ZERO).await;
        let a = f.queue.enqueue_task(task("a").with_priority(3)).await.unwrap();
        let b = f.queue.enqueue_task(task("b").with_priority(7)).await.unwrap();
        let c = f.queue.enqueue_task(task("c").with_priority(7)).await.unwrap();

        assert_eq!(f.queue.dequeue_task("a1").await.unwrap().id, b);
        assert_eq!(f.queue.dequeue_task("a1").await.unwrap().id, c);
        assert_eq!(f.queue.dequeue_task("a1").await.unwrap().id, a);
        assert!(f.queue.dequeue_task("a1").await.is_none());
        assert!(f.queue.dequeue_task("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_set_task_priority_reorders_existing_queues() {
        let f = fixture(fast_config(), Duration::ZERO).await;
        f.queue.enqueue_task(task("y")).await.unwrap();
        f.queue.enqueue_task(task("x")).await.unwrap();
        f.queue.set_task_priority("x", 9).await;
        f.queue.enqueue_task(task("y")).await.unwrap();

        let order: Vec<String> = f
            .queue
            .queued_tasks("a1")
            .await
            .into_iter()
            .map(|t| t.task_type)
            .collect();
        assert_eq!(order, vec!["x", "y", "y"]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_when_full() {
        let config = QueueConfig {
            max_queue_size: 2,
            ..fast_config()
        };
        let f = fixture(config, Duration::ZERO).await;
        f.queue.enqueue_task(task("a")).await.unwrap();
        f.queue.enqueue_task(task("b")).await.unwrap();
        let err = f.queue.enqueue_task(task("c")).await.unwrap_err();
        assert!(matches!(err, ConductorError::Capacity(_)));
        assert_eq!(f.queue.queue_length("a1").await, 2);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_never_runs() {
        let f = fixture(fast_config(), Duration::ZERO).await;
        let id = f.queue.enqueue_task(task("a")).await.unwrap();
        let kept = f.queue.enqueue_task(task("b")).await.unwrap();

        assert!(f.queue.cancel_task(id).await);
        assert!(!f.queue.cancel_task(id).await);
        assert_eq!(f.queue.queue_length("a1").await, 1);

        f.queue.start().await;
        wait_for_completed(&f.queue, "a1", 1).await;
        f.queue.stop().await;

        let completed = f.queue.completed_executions("a1").await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].task.id, kept);
        assert!(f.queue.active_executions().await.is_empty());
        assert_eq!(f.queue.task_status(id).await, None);
    }

    #[tokio::test]
    async fn test_executes_and_records_completion() {
        let f = fixture(fast_config(), Duration::ZERO).await;
        let mut events = f.queue.subscribe();
        let id = f.queue.enqueue_task(task("report")).await.unwrap();

        f.queue.start().await;
        wait_for_completed(&f.queue, "a1", 1).await;
        f.queue.stop().await;

        let done = &f.queue.completed_executions("a1").await[0];
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"done": "report"})));
        assert_eq!(f.queue.task_status(id).await, Some(TaskStatus::Completed));
        assert_eq!(f.monitoring.metrics_named("a1", "task_duration").await.len(), 1);
        assert!(f.handler.calls.lock().unwrap().is_empty());

        assert!(matches!(events.recv().await.unwrap(), QueueEvent::TaskEnqueued { .. }));
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::TaskStarted { .. }));
        assert!(matches!(events.recv().await.unwrap(), QueueEvent::TaskCompleted { .. }));
    }

    #[tokio::test]
    async fn test_one_execution_per_agent() {
        let f = fixture(fast_config(), Duration::from_millis(40)).await;
        for _ in 0..3 {
            f.queue.enqueue_task(task("slow")).await.unwrap();
        }

        f.queue.start().await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(f.queue.active_executions().await.len() <= 1);
        wait_for_completed(&f.queue, "a1", 3).await;
        f.queue.stop().await;

        assert_eq!(f.agent.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(f.queue.stats().await.completed, 3);
    }

    #[tokio::test]
    async fn test_independent_agents_run_concurrently() {
        let f = fixture(fast_config(), Duration::from_millis(150)).await;
        let other = WorkAgent::new(Duration::from_millis(150));
        f.registry.register("a2", other.clone()).await;

        f.queue.enqueue_task(task("slow")).await.unwrap();
        f.queue
            .enqueue_task(Task::new("a2", "slow", serde_json::Value::Null))
            .await
            .unwrap();

        f.queue.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.queue.active_executions().await.len(), 2);
        wait_for_completed(&f.queue, "a2", 1).await;
        f.queue.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_failure() {
        let f = fixture(fast_config(), Duration::from_millis(200)).await;
        let id = f
            .queue
            .enqueue_task(task("slow").with_timeout(Duration::from_millis(30)))
            .await
            .unwrap();

        f.queue.start().await;
        wait_for_completed(&f.queue, "a1", 1).await;
        f.queue.stop().await;

        let done = &f.queue.completed_executions("a1").await[0];
        assert_eq!(done.status, TaskStatus::Timeout);
        assert!(f.queue.active_execution("a1").await.is_none());
        assert_eq!(f.queue.task_status(id).await, Some(TaskStatus::Timeout));

        let calls = f.handler.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "timeout");
        assert_eq!(calls[0].1.component, "TaskQueue");
        assert_eq!(calls[0].1.correlation_id, Some(id.to_string()));
    }

    #[tokio::test]
    async fn test_failure_is_forwarded_to_error_handler() {
        let f = fixture(fast_config(), Duration::ZERO).await;
        f.queue.enqueue_task(task("explode")).await.unwrap();

        f.queue.start().await;
        wait_for_completed(&f.queue, "a1", 1).await;
        f.queue.stop().await;

        let done = &f.queue.completed_executions("a1").await[0];
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("kaboom"));
        assert_eq!(f.handler.calls.lock().unwrap()[0].0, "execution");
        assert_eq!(f.monitoring.metrics_named("a1", "task_failed").await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_task_discards_result() {
        let f = fixture(fast_config(), Duration::from_millis(80)).await;
        let id = f.queue.enqueue_task(task("slow")).await.unwrap();

        f.queue.tick().await;
        assert!(f.queue.active_execution("a1").await.is_some());

        assert!(f.queue.cancel_task(id).await);
        assert!(f.queue.active_execution("a1").await.is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let ledger = f.queue.completed_executions("a1").await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, TaskStatus::Canceled);
        // the agent call itself was not interrupted
        assert_eq!(f.agent.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_agent_is_skipped() {
        let f = fixture(fast_config(), Duration::ZERO).await;
        f.queue
            .enqueue_task(Task::new("ghost", "t", serde_json::Value::Null))
            .await
            .unwrap();

        f.queue.tick().await;
        assert_eq!(f.queue.queue_length("ghost").await, 1);
        assert!(f.queue.active_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_completed_ledger_is_bounded() {
        let config = QueueConfig {
            max_completed: 2,
            ..fast_config()
        };
        let f = fixture(config, Duration::ZERO).await;
        for name in ["one", "two", "three"] {
            f.queue.enqueue_task(task(name)).await.unwrap();
        }

        f.queue.start().await;
        for _ in 0..300 {
            if f.agent.runs.load(Ordering::SeqCst) == 3 && f.queue.active_executions().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.queue.stop().await;

        let ledger: Vec<String> = f
            .queue
            .completed_executions("a1")
            .await
            .into_iter()
            .map(|e| e.task.task_type)
            .collect();
        assert_eq!(ledger, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_stop_and_configure() {
        let f = fixture(fast_config(), Duration::ZERO).await;
        f.queue.start().await;
        assert!(f.queue.is_running().await);
        f.queue.stop().await;
        assert!(!f.queue.is_running().await);

        f.queue.enqueue_task(task("idle")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.queue.queue_length("a1").await, 1);

        f.queue.start().await;
        f.queue
            .configure(QueueConfig {
                poll_interval_ms: 5,
                ..fast_config()
            })
            .await
            .unwrap();
        assert!(f.queue.is_running().await);
        wait_for_completed(&f.queue, "a1", 1).await;
        f.queue.stop().await;

        let invalid = QueueConfig {
            max_queue_size: 0,
            ..fast_config()
        };
        assert!(f.queue.configure(invalid).await.is_err());
    }

    #[tokio::test]
    async fn test_prioritizer_scores_unprioritized_tasks() {
        let agent = WorkAgent::new(Duration::ZERO);
        let registry = Arc::new(InMemoryAgentRegistry::new());
        registry.register("a1", agent).await;
        let prioritizer = Arc::new(TaskPrioritizer::new(PrioritizerConfig {
            dynamic_adjustment: false,
            ..Default::default()
        }));
        prioritizer
            .add_rule(crate::prioritizer::PriorityRule::new(
                "workers favour audits",
                crate::prioritizer::RuleCondition::Fields(crate::prioritizer::RuleConditions {
                    task_types: vec!["audit".into()],
                    agent_types: vec!["worker".into()],
                    ..Default::default()
                }),
                9,
            ))
            .await
            .unwrap();

        let queue = TaskQueue::with_prioritizer(
            fast_config(),
            registry,
            Arc::new(InMemoryMonitoring::new()),
            Arc::new(RecordingHandler::default()),
            prioritizer.clone(),
        );
        queue.enqueue_task(task("chore")).await.unwrap();
        let audit = queue.enqueue_task(task("audit")).await.unwrap();

        assert_eq!(queue.queued_tasks("a1").await[0].id, audit);
        assert_eq!(prioritizer.priority_history(audit).await[0].priority, 9);
    }

    #[tokio::test]
    async fn test_waiting_task_ages_ahead_of_later_arrivals() {
        let registry = Arc::new(InMemoryAgentRegistry::new());
        registry.register("a1", WorkAgent::new(Duration::from_millis(200))).await;
        let prioritizer = Arc::new(TaskPrioritizer::new(PrioritizerConfig {
            low_load: 0.0,
            high_load: 1.0,
            aging_interval_minutes: 30,
            ..Default::default()
        }));
        prioritizer
            .add_rule(crate::prioritizer::PriorityRule::new(
                "urgent first",
                crate::prioritizer::RuleCondition::Fields(
                    crate::prioritizer::RuleConditions::task_types(["urgent"]),
                ),
                7,
            ))
            .await
            .unwrap();
        let queue = TaskQueue::with_prioritizer(
            fast_config(),
            registry,
            Arc::new(InMemoryMonitoring::new()),
            Arc::new(RecordingHandler::default()),
            prioritizer.clone(),
        );

        let routine = queue.enqueue_task(task("routine")).await.unwrap();
        let urgent = queue.enqueue_task(task("urgent")).await.unwrap();
        assert_eq!(queue.queued_tasks("a1").await[0].id, urgent);

        // three hours in the backlog is six aging intervals
        {
            let mut state = queue.inner.state.write().await;
            let backlog = state.queues.get_mut("a1").unwrap();
            let waiting = backlog.iter_mut().find(|q| q.task.id == routine).unwrap();
            waiting.task.created_at = Utc::now() - chrono::Duration::hours(3);
        }

        queue.tick().await;
        assert_eq!(queue.active_execution("a1").await.unwrap().task.id, routine);
        assert_eq!(queue.queued_tasks("a1").await[0].id, urgent);

        let history = prioritizer.priority_history(routine).await;
        assert_eq!(history.first().unwrap().priority, 5);
        assert_eq!(history.last().unwrap().priority, 10);
    }
}
