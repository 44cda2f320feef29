use crate::config::SchedulerConfig;
use crate::events::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, ErrorContext, ErrorHandler, Task};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "TaskScheduler";

/// Destination for work the scheduler materializes when a schedule comes due.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Accept one materialized task. An error fails the schedule.
    async fn submit(&self, task: Task) -> ConductorResult<()>;
}

/// When a scheduled task fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSchedule {
    /// Fire once at a fixed time. A time in the past fires immediately.
    Once {
        /// Due time.
        at: DateTime<Utc>,
    },
    /// Fire every `interval_ms`, starting one interval from now.
    Recurring {
        /// Time between runs.
        interval_ms: u64,
        /// Stop after this many runs; unbounded when unset.
        #[serde(default)]
        max_runs: Option<u32>,
    },
    /// Fire on a cron expression (seconds first, 6 or 7 fields).
    Cron {
        /// Cron expression.
        expression: String,
    },
}

impl TaskSchedule {
    /// Fire once at `at`.
    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    /// Fire every `interval`, at most `max_runs` times.
    pub fn recurring(interval: Duration, max_runs: Option<u32>) -> Self {
        Self::Recurring {
            interval_ms: interval.as_millis() as u64,
            max_runs,
        }
    }

    /// Fire on a cron expression. Validated when scheduled.
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    fn validate(&self) -> ConductorResult<()> {
        match self {
            Self::Once { .. } => Ok(()),
            Self::Recurring { interval_ms: 0, .. } => Err(ConductorError::Config(
                "recurring interval must be > 0".into(),
            )),
            Self::Recurring { .. } => Ok(()),
            Self::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// Next fire time after `from`, given how many runs already happened.
    /// `None` means the schedule is exhausted.
    fn next_run(&self, from: DateTime<Utc>, run_count: u32) -> ConductorResult<Option<DateTime<Utc>>> {
        match self {
            Self::Once { at } => Ok((run_count == 0).then_some(*at)),
            Self::Recurring {
                interval_ms,
                max_runs,
            } => {
                if max_runs.is_some_and(|max| run_count >= max) {
                    return Ok(None);
                }
                let interval = chrono::Duration::milliseconds(*interval_ms as i64);
                Ok(Some(from + interval))
            }
            Self::Cron { expression } => Ok(parse_cron(expression)?.after(&from).next()),
        }
    }
}

/// Parse a cron expression into a [`cron::Schedule`].
///
/// Accepts the 6-field (sec min hour dom month dow) or 7-field (with year)
/// format.
pub fn parse_cron(expression: &str) -> ConductorResult<Schedule> {
    Schedule::from_str(expression).map_err(|e| {
        ConductorError::Config(format!("Invalid cron expression '{expression}': {e}"))
    })
}

/// Where a schedule is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Waiting for the next run.
    Scheduled,
    /// Handing a task to the sink.
    Running,
    /// No runs left.
    Completed,
    /// The sink or the schedule itself failed. Never retried.
    Failed,
    /// Canceled by request.
    Canceled,
}

impl ScheduleStatus {
    /// Completed, failed or canceled.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// A time-triggered task definition.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    /// Schedule id.
    pub id: Uuid,
    /// Agent the materialized tasks target.
    pub agent_id: String,
    /// Task type of the materialized tasks.
    pub task_type: String,
    /// Payload copied into each materialized task.
    pub payload: serde_json::Value,
    /// Explicit priority for materialized tasks.
    pub priority: Option<u8>,
    /// When to fire.
    pub schedule: TaskSchedule,
    /// Current status.
    pub status: ScheduleStatus,
    /// Runs fired so far.
    pub run_count: u32,
    /// Next due time; `None` once finished.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Time of the last run.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Failure text when `Failed`.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    fn materialize(&self) -> Task {
        let task = Task::new(&self.agent_id, &self.task_type, self.payload.clone());
        match self.priority {
            Some(p) => task.with_priority(p),
            None => task,
        }
    }
}

/// Partial update for [`TaskScheduler::update_task_schedule`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    /// New task type.
    pub task_type: Option<String>,
    /// New payload.
    pub payload: Option<serde_json::Value>,
    /// New priority.
    pub priority: Option<u8>,
    /// New schedule; recomputes the next run from now.
    pub schedule: Option<TaskSchedule>,
}

/// Notifications published by the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A schedule was registered.
    TaskScheduled {
        /// New schedule.
        schedule_id: Uuid,
    },
    /// A task was materialized and handed to the sink.
    TaskFired {
        /// Firing schedule.
        schedule_id: Uuid,
        /// Materialized task.
        task_id: Uuid,
        /// Run number, starting at 1.
        run: u32,
    },
    /// A schedule was changed through an update.
    ScheduleUpdated {
        /// Updated schedule.
        schedule_id: Uuid,
    },
    /// A schedule ran out of runs.
    TaskCompleted {
        /// Finished schedule.
        schedule_id: Uuid,
    },
    /// A schedule failed.
    TaskFailed {
        /// Failed schedule.
        schedule_id: Uuid,
        /// Failure text.
        error: String,
    },
    /// A schedule was canceled.
    TaskCanceled {
        /// Canceled schedule.
        schedule_id: Uuid,
    },
}

/// Boxed so timers can spawn a fire that may rearm another timer.
type FireFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    config: SchedulerConfig,
    tasks: RwLock<HashMap<Uuid, ScheduledTask>>,
    timers: Mutex<HashMap<Uuid, Timer>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    generation: AtomicU64,
    sink: Arc<dyn TaskSink>,
    error_handler: Arc<dyn ErrorHandler>,
    events: EventBus<SchedulerEvent>,
}

/// Materializes tasks into a [`TaskSink`] at their due times.
///
/// Each scheduled task gets its own timer while the scheduler runs; a slower
/// sweep fires anything overdue whose timer went missing.
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Scheduler handing due tasks to `sink`. Nothing fires until [`TaskScheduler::start`].
    pub fn new(
        config: SchedulerConfig,
        sink: Arc<dyn TaskSink>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tasks: RwLock::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                poller: Mutex::new(None),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                sink,
                error_handler,
                events: EventBus::default(),
            }),
        }
    }

    /// Receive scheduler notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Register a new schedule. Fails on invalid schedules and when the
    /// number of live schedules is at capacity.
    pub async fn schedule_task(
        &self,
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        schedule: TaskSchedule,
    ) -> ConductorResult<Uuid> {
        self.schedule(agent_id.into(), task_type.into(), payload, None, schedule)
            .await
    }

    /// Like [`TaskScheduler::schedule_task`] with an explicit priority on the
    /// materialized tasks.
    pub async fn schedule_task_with_priority(
        &self,
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        priority: u8,
        schedule: TaskSchedule,
    ) -> ConductorResult<Uuid> {
        self.schedule(agent_id.into(), task_type.into(), payload, Some(priority), schedule)
            .await
    }

    async fn schedule(
        &self,
        agent_id: String,
        task_type: String,
        payload: serde_json::Value,
        priority: Option<u8>,
        schedule: TaskSchedule,
    ) -> ConductorResult<Uuid> {
        schedule.validate()?;
        let now = Utc::now();
        let next_run_at = schedule.next_run(now, 0)?;

        let id = Uuid::new_v4();
        {
            let mut tasks = self.inner.tasks.write().await;
            let live = tasks.values().filter(|t| !t.status.is_terminal()).count();
            if live >= self.inner.config.max_scheduled_tasks {
                warn!(agent_id = %agent_id, live, "Scheduler at capacity, rejecting schedule");
                return Err(ConductorError::Capacity(format!(
                    "scheduler holds {live} live tasks (max {})",
                    self.inner.config.max_scheduled_tasks
                )));
            }
            tasks.insert(
                id,
                ScheduledTask {
                    id,
                    agent_id: agent_id.clone(),
                    task_type,
                    payload,
                    priority,
                    schedule,
                    status: if next_run_at.is_some() {
                        ScheduleStatus::Scheduled
                    } else {
                        ScheduleStatus::Completed
                    },
                    run_count: 0,
                    next_run_at,
                    last_run_at: None,
                    last_error: None,
                    created_at: now,
                },
            );
            evict_finished(&mut tasks, self.inner.config.max_finished_retained);
        }

        info!(schedule_id = %id, agent_id = %agent_id, next_run_at = ?next_run_at, "Task scheduled");
        if let Some(at) = next_run_at {
            if self.is_running() {
                self.inner.arm(id, at).await;
            }
        }
        self.inner
            .events
            .publish(SchedulerEvent::TaskScheduled { schedule_id: id });
        Ok(id)
    }

    /// Cancel a live schedule. Returns `false` for unknown or finished ones.
    pub async fn cancel_scheduled_task(&self, schedule_id: Uuid) -> bool {
        {
            let mut tasks = self.inner.tasks.write().await;
            match tasks.get_mut(&schedule_id) {
                Some(task) if !task.status.is_terminal() => {
                    task.status = ScheduleStatus::Canceled;
                    task.next_run_at = None;
                }
                _ => return false,
            }
            evict_finished(&mut tasks, self.inner.config.max_finished_retained);
        }
        self.inner.disarm(schedule_id).await;
        info!(schedule_id = %schedule_id, "Scheduled task canceled");
        self.inner
            .events
            .publish(SchedulerEvent::TaskCanceled { schedule_id });
        true
    }

    /// Apply a partial update. A new schedule recomputes the next run from now
    /// and rearms the timer.
    pub async fn update_task_schedule(
        &self,
        schedule_id: Uuid,
        update: ScheduleUpdate,
    ) -> ConductorResult<ScheduledTask> {
        if let Some(schedule) = &update.schedule {
            schedule.validate()?;
        }

        let (snapshot, rearm) = {
            let mut tasks = self.inner.tasks.write().await;
            let task = tasks.get_mut(&schedule_id).ok_or_else(|| {
                ConductorError::NotFound(format!("scheduled task {schedule_id}"))
            })?;
            if task.status.is_terminal() {
                return Err(ConductorError::State(format!(
                    "scheduled task {schedule_id} is {:?}",
                    task.status
                )));
            }

            if let Some(task_type) = update.task_type {
                task.task_type = task_type;
            }
            if let Some(payload) = update.payload {
                task.payload = payload;
            }
            if update.priority.is_some() {
                task.priority = update.priority;
            }

            let mut rearm = None;
            if let Some(schedule) = update.schedule {
                if schedule != task.schedule {
                    task.schedule = schedule;
                    // a firing in progress recomputes on its own
                    if task.status == ScheduleStatus::Scheduled {
                        task.next_run_at = task.schedule.next_run(Utc::now(), task.run_count)?;
                        if task.next_run_at.is_none() {
                            task.status = ScheduleStatus::Completed;
                        }
                        rearm = Some(task.next_run_at);
                    }
                }
            }
            (task.clone(), rearm)
        };

        if let Some(next) = rearm {
            self.inner.disarm(schedule_id).await;
            if let (Some(at), true) = (next, self.is_running()) {
                self.inner.arm(schedule_id, at).await;
            }
        }
        debug!(schedule_id = %schedule_id, next_run_at = ?snapshot.next_run_at, "Schedule updated");
        self.inner
            .events
            .publish(SchedulerEvent::ScheduleUpdated { schedule_id });
        Ok(snapshot)
    }

    /// Arm every pending schedule and start the overdue sweep.
    pub async fn start(&self) {
        let mut poller = self.inner.poller.lock().await;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending: Vec<(Uuid, DateTime<Utc>)> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == ScheduleStatus::Scheduled)
            .filter_map(|t| t.next_run_at.map(|at| (t.id, at)))
            .collect();
        for (id, at) in &pending {
            self.inner.arm(*id, *at).await;
        }

        let weak = Arc::downgrade(&self.inner);
        *poller = Some(tokio::spawn(sweep_loop(weak, self.inner.config.poll_interval())));
        info!(armed = pending.len(), "Task scheduler started");
    }

    /// Stop all timers and the sweep. Schedules keep their state.
    pub async fn stop(&self) {
        let mut poller = self.inner.poller.lock().await;
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = poller.take() {
            handle.abort();
        }
        let mut timers = self.inner.timers.lock().await;
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        info!("Task scheduler stopped");
    }

    /// Whether timers and the sweep are running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Snapshot of one schedule.
    pub async fn get_scheduled_task(&self, schedule_id: Uuid) -> Option<ScheduledTask> {
        self.inner.tasks.read().await.get(&schedule_id).cloned()
    }

    /// All schedules, soonest first; finished ones last.
    pub async fn scheduled_tasks(&self) -> Vec<ScheduledTask> {
        let mut all: Vec<ScheduledTask> = self.inner.tasks.read().await.values().cloned().collect();
        all.sort_by_key(|t| (t.next_run_at.is_none(), t.next_run_at, t.created_at));
        all
    }

    /// Schedules targeting an agent, oldest first.
    pub async fn tasks_for_agent(&self, agent_id: &str) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self
            .inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Drop finished schedules. Returns how many were removed.
    pub async fn purge_finished(&self) -> usize {
        let mut tasks = self.inner.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !t.status.is_terminal());
        before - tasks.len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.inner.poller.try_lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
        if let Ok(mut timers) = self.inner.timers.try_lock() {
            for (_, timer) in timers.drain() {
                timer.handle.abort();
            }
        }
    }
}

async fn sweep_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let now = Utc::now();
        let overdue: Vec<Uuid> = inner
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == ScheduleStatus::Scheduled)
            .filter(|t| t.next_run_at.is_some_and(|at| at <= now))
            .map(|t| t.id)
            .collect();
        for id in overdue {
            debug!(schedule_id = %id, "Firing overdue schedule from sweep");
            // detached so stopping the sweep never cancels a fire halfway
            tokio::spawn(Arc::clone(&inner).fire(id, None));
        }
    }
}

/// Drop the oldest finished schedules beyond `keep`.
fn evict_finished(tasks: &mut HashMap<Uuid, ScheduledTask>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = tasks
        .values()
        .filter(|t| t.status.is_terminal())
        .map(|t| (t.last_run_at.unwrap_or(t.created_at), t.id))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        tasks.remove(&id);
    }
    debug!(evicted = excess, "Evicted finished schedules");
}

impl Inner {
    async fn arm(self: &Arc<Self>, id: Uuid, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(self);

        // held across the spawn so the timer cannot clear its entry before it exists
        let mut timers = self.timers.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut timers = inner.timers.lock().await;
                if timers.get(&id).is_some_and(|t| t.generation == generation) {
                    timers.remove(&id);
                }
            }
            inner.fire(id, Some(at)).await;
        });
        if let Some(previous) = timers.insert(id, Timer { generation, handle }) {
            previous.handle.abort();
        }
    }

    async fn disarm(&self, id: Uuid) {
        if let Some(timer) = self.timers.lock().await.remove(&id) {
            timer.handle.abort();
        }
    }

    /// Fire a schedule if it is still due. Timer fires pass the time they were
    /// armed for; sweep fires pass `None` and require the due time to have
    /// passed.
    fn fire(self: Arc<Self>, id: Uuid, armed_for: Option<DateTime<Utc>>) -> FireFuture {
        Box::pin(async move {
            let (task, agent_id, run) = {
                let mut tasks = self.tasks.write().await;
                let Some(scheduled) = tasks.get_mut(&id) else {
                    return;
                };
                let due = match armed_for {
                    Some(at) => scheduled.next_run_at == Some(at),
                    None => scheduled.next_run_at.is_some_and(|at| at <= Utc::now()),
                };
                if scheduled.status != ScheduleStatus::Scheduled || !due {
                    return;
                }
                scheduled.status = ScheduleStatus::Running;
                scheduled.run_count += 1;
                scheduled.last_run_at = Some(Utc::now());
                (
                    scheduled.materialize(),
                    scheduled.agent_id.clone(),
                    scheduled.run_count,
                )
            };

            let task_id = task.id;
            info!(schedule_id = %id, task_id = %task_id, agent_id = %agent_id, run, "Firing scheduled task");
            self.events.publish(SchedulerEvent::TaskFired {
                schedule_id: id,
                task_id,
                run,
            });

            let outcome = self.sink.submit(task).await;

            let (next, failure) = {
                let mut tasks = self.tasks.write().await;
                let Some(scheduled) = tasks.get_mut(&id) else {
                    return;
                };
                if scheduled.status != ScheduleStatus::Running {
                    // canceled while the sink was busy
                    return;
                }
                let next = match outcome {
                    Ok(()) => {
                        let from = scheduled.last_run_at.unwrap_or_else(Utc::now);
                        scheduled.schedule.next_run(from, scheduled.run_count)
                    }
                    Err(e) => Err(e),
                };
                let settled = match next {
                    Ok(Some(at)) => {
                        scheduled.status = ScheduleStatus::Scheduled;
                        scheduled.next_run_at = Some(at);
                        (Some(at), None)
                    }
                    Ok(None) => {
                        scheduled.status = ScheduleStatus::Completed;
                        scheduled.next_run_at = None;
                        (None, None)
                    }
                    Err(e) => {
                        scheduled.status = ScheduleStatus::Failed;
                        scheduled.next_run_at = None;
                        scheduled.last_error = Some(e.to_string());
                        (None, Some(e))
                    }
                };
                if settled.0.is_none() {
                    evict_finished(&mut tasks, self.config.max_finished_retained);
                }
                settled
            };

            if let Some(err) = failure {
                error!(schedule_id = %id, agent_id = %agent_id, error = %err, "Scheduled task failed");
                self.error_handler
                    .handle_error(
                        &err,
                        ErrorContext::new(&agent_id, COMPONENT, "fire_scheduled_task").with_correlation(id),
                    )
                    .await;
                self.events.publish(SchedulerEvent::TaskFailed {
                    schedule_id: id,
                    error: err.to_string(),
                });
                return;
            }

            match next {
                Some(at) => {
                    if self.running.load(Ordering::SeqCst) {
                        self.arm(id, at).await;
                    }
                }
                None => {
                    debug!(schedule_id = %id, runs = run, "Schedule exhausted");
                    self.events
                        .publish(SchedulerEvent::TaskCompleted { schedule_id: id });
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::TracingErrorHandler;

    #[derive(Default)]
    struct RecordingSink {
        tasks: std::sync::Mutex<Vec<Task>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.tasks.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TaskSink for RecordingSink {
        async fn submit(&self, task: Task) -> ConductorResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConductorError::Capacity("sink full".into()));
            }
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        contexts: std::sync::Mutex<Vec<ErrorContext>>,
    }

    #[async_trait]
    impl ErrorHandler for CountingHandler {
        async fn handle_error(&self, _error: &ConductorError, context: ErrorContext) {
            self.contexts.lock().unwrap().push(context);
        }
    }

    fn scheduler(sink: Arc<RecordingSink>) -> TaskScheduler {
        TaskScheduler::new(
            SchedulerConfig {
                poll_interval_ms: 60_000,
                ..Default::default()
            },
            sink,
            Arc::new(TracingErrorHandler),
        )
    }

    fn in_ms(ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn test_parse_cron() {
        assert!(parse_cron("0 * * * * *").is_ok());
        assert!(parse_cron("0 * * * * * *").is_ok());
        assert!(matches!(
            parse_cron("not a cron expression"),
            Err(ConductorError::Config(_))
        ));
    }

    #[test]
    fn test_next_run_per_kind() {
        let now = Utc::now();
        let once = TaskSchedule::once(now);
        assert_eq!(once.next_run(now, 0).unwrap(), Some(now));
        assert_eq!(once.next_run(now, 1).unwrap(), None);

        let recurring = TaskSchedule::recurring(Duration::from_secs(1), Some(2));
        assert_eq!(
            recurring.next_run(now, 1).unwrap(),
            Some(now + chrono::Duration::seconds(1))
        );
        assert_eq!(recurring.next_run(now, 2).unwrap(), None);

        let cron = TaskSchedule::cron("0 * * * * *");
        assert!(cron.next_run(now, 5).unwrap().unwrap() > now);
    }

    #[tokio::test]
    async fn test_recurring_stops_at_max_runs() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(sink.clone());
        scheduler.start().await;

        let id = scheduler
            .schedule_task(
                "a1",
                "heartbeat",
                serde_json::Value::Null,
                TaskSchedule::recurring(Duration::from_millis(30), Some(3)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.count(), 3);

        let task = scheduler.get_scheduled_task(id).await.unwrap();
        assert_eq!(task.run_count, 3);
        assert_eq!(task.status, ScheduleStatus::Completed);
        assert!(task.next_run_at.is_none());
        assert!(scheduler.inner.timers.lock().await.is_empty());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_once_fires_once_with_payload() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(sink.clone());
        scheduler.start().await;
        let mut events = scheduler.subscribe();

        let id = scheduler
            .schedule_task_with_priority(
                "a1",
                "report",
                serde_json::json!({"period": "daily"}),
                8,
                TaskSchedule::once(in_ms(20)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let tasks = sink.tasks.lock().unwrap().clone();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].agent_id, "a1");
        assert_eq!(tasks[0].priority, Some(8));
        assert_eq!(tasks[0].payload["period"], "daily");
        assert_eq!(
            scheduler.get_scheduled_task(id).await.unwrap().status,
            ScheduleStatus::Completed
        );

        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::TaskScheduled { .. }));
        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::TaskFired { run: 1, .. }));
        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::TaskCompleted { .. }));
    }

    #[tokio::test]
    async fn test_nothing_fires_until_started() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(sink.clone());
        scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, TaskSchedule::once(in_ms(10)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.count(), 0);

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.count(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(sink.clone());
        scheduler.start().await;
        let id = scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, TaskSchedule::once(in_ms(40)))
            .await
            .unwrap();

        assert!(scheduler.cancel_scheduled_task(id).await);
        assert!(!scheduler.cancel_scheduled_task(id).await);
        assert!(!scheduler.cancel_scheduled_task(Uuid::new_v4()).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.count(), 0);
        let task = scheduler.get_scheduled_task(id).await.unwrap();
        assert_eq!(task.status, ScheduleStatus::Canceled);
        assert!(task.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_capacity_counts_live_schedules() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = TaskScheduler::new(
            SchedulerConfig {
                max_scheduled_tasks: 1,
                ..Default::default()
            },
            sink,
            Arc::new(TracingErrorHandler),
        );
        let far = TaskSchedule::once(in_ms(60_000));
        let first = scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, far.clone())
            .await
            .unwrap();
        let err = scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, far.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Capacity(_)));

        scheduler.cancel_scheduled_task(first).await;
        assert!(scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, far)
            .await
            .is_ok());
        assert_eq!(scheduler.purge_finished().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_schedules_rejected() {
        let scheduler = scheduler(Arc::new(RecordingSink::default()));
        let err = scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, TaskSchedule::cron("every tuesday"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Config(_)));

        let err = scheduler
            .schedule_task(
                "a1",
                "t",
                serde_json::Value::Null,
                TaskSchedule::recurring(Duration::ZERO, None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Config(_)));
        assert!(scheduler.scheduled_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_cron_schedule_fires() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(sink.clone());
        scheduler.start().await;
        let id = scheduler
            .schedule_task("a1", "tick", serde_json::Value::Null, TaskSchedule::cron("* * * * * *"))
            .await
            .unwrap();
        assert!(scheduler.get_scheduled_task(id).await.unwrap().next_run_at.is_some());

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert!(sink.count() >= 1);
        let task = scheduler.get_scheduled_task(id).await.unwrap();
        assert_eq!(task.status, ScheduleStatus::Scheduled);
        assert!(task.next_run_at.is_some());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_update_schedule_rearms() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(sink.clone());
        scheduler.start().await;
        let id = scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, TaskSchedule::once(in_ms(60_000)))
            .await
            .unwrap();

        let updated = scheduler
            .update_task_schedule(
                id,
                ScheduleUpdate {
                    payload: Some(serde_json::json!({"v": 2})),
                    schedule: Some(TaskSchedule::once(in_ms(20))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.next_run_at.unwrap() < in_ms(1_000));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let tasks = sink.tasks.lock().unwrap().clone();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].payload["v"], 2);

        let err = scheduler
            .update_task_schedule(id, ScheduleUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::State(_)));
        let err = scheduler
            .update_task_schedule(Uuid::new_v4(), ScheduleUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NotFound(_)));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_sink_failure_marks_failed_without_retry() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let handler = Arc::new(CountingHandler::default());
        let scheduler = TaskScheduler::new(SchedulerConfig::default(), sink.clone(), handler.clone());
        scheduler.start().await;

        let id = scheduler
            .schedule_task(
                "a1",
                "t",
                serde_json::Value::Null,
                TaskSchedule::recurring(Duration::from_millis(20), None),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let task = scheduler.get_scheduled_task(id).await.unwrap();
        assert_eq!(task.status, ScheduleStatus::Failed);
        assert_eq!(task.run_count, 1);
        assert!(task.last_error.unwrap().contains("sink full"));

        let contexts = handler.contexts.lock().unwrap().clone();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].component, "TaskScheduler");
        assert_eq!(contexts[0].correlation_id, Some(id.to_string()));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_fires_when_timer_is_lost() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = TaskScheduler::new(
            SchedulerConfig {
                poll_interval_ms: 25,
                ..Default::default()
            },
            sink.clone(),
            Arc::new(TracingErrorHandler),
        );
        scheduler.start().await;
        let id = scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, TaskSchedule::once(in_ms(30)))
            .await
            .unwrap();
        scheduler.inner.disarm(id).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.count(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_clears_timers() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler(sink.clone());
        scheduler.start().await;
        scheduler
            .schedule_task(
                "a1",
                "t",
                serde_json::Value::Null,
                TaskSchedule::recurring(Duration::from_millis(20), None),
            )
            .await
            .unwrap();

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        assert!(scheduler.inner.timers.lock().await.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.count(), 0);
        assert_eq!(scheduler.tasks_for_agent("a1").await.len(), 1);
    }

    struct SlowSink {
        delay: Duration,
        submitted: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl TaskSink for SlowSink {
        async fn submit(&self, _task: Task) -> ConductorResult<()> {
            tokio::time::sleep(self.delay).await;
            *self.submitted.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_during_sweep_fire_still_settles_schedule() {
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(200),
            submitted: std::sync::Mutex::new(0),
        });
        let scheduler = TaskScheduler::new(
            SchedulerConfig {
                poll_interval_ms: 10,
                ..Default::default()
            },
            sink.clone(),
            Arc::new(TracingErrorHandler),
        );
        scheduler.start().await;
        let id = scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, TaskSchedule::once(in_ms(20)))
            .await
            .unwrap();
        scheduler.inner.disarm(id).await;

        // the sweep picks it up and the sink is still busy
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            scheduler.get_scheduled_task(id).await.unwrap().status,
            ScheduleStatus::Running
        );
        scheduler.stop().await;
        scheduler.start().await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        let task = scheduler.get_scheduled_task(id).await.unwrap();
        assert_eq!(task.status, ScheduleStatus::Completed);
        assert_eq!(task.run_count, 1);
        assert_eq!(task.next_run_at, None);
        assert_eq!(*sink.submitted.lock().unwrap(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_finished_schedules_are_evicted_beyond_retention() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = TaskScheduler::new(
            SchedulerConfig {
                poll_interval_ms: 60_000,
                max_finished_retained: 2,
                ..Default::default()
            },
            sink,
            Arc::new(TracingErrorHandler),
        );

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = scheduler
                .schedule_task("a1", "t", serde_json::Value::Null, TaskSchedule::once(in_ms(60_000)))
                .await
                .unwrap();
            assert!(scheduler.cancel_scheduled_task(id).await);
            ids.push(id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let live = scheduler
            .schedule_task("a1", "t", serde_json::Value::Null, TaskSchedule::once(in_ms(60_000)))
            .await
            .unwrap();

        let remaining = scheduler.scheduled_tasks().await;
        assert_eq!(remaining.len(), 3);
        assert!(scheduler.get_scheduled_task(live).await.is_some());
        assert!(scheduler.get_scheduled_task(ids[0]).await.is_none());
        assert!(scheduler.get_scheduled_task(ids[4]).await.is_some());
        assert!(scheduler.get_scheduled_task(ids[3]).await.is_some());
    }
}
