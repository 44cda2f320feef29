use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Engine configuration, one section per component.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Agent lifecycle manager.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Task queue.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Task prioritizer.
    #[serde(default)]
    pub prioritizer: PrioritizerConfig,
    /// Task scheduler.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Communication bus.
    #[serde(default)]
    pub bus: BusConfig,
    /// Error recovery.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl ConductorConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        let config: ConductorConfig = toml::from_str(raw)
            .map_err(|e| ConductorError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConductorError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check every section. Returns the first violation as a `Config` error.
    pub fn validate(&self) -> ConductorResult<()> {
        self.queue.validate()?;
        self.prioritizer.validate()?;
        self.scheduler.validate()?;
        if self.bus.max_history == 0 {
            return Err(ConductorError::Config("bus.max_history must be > 0".into()));
        }
        if self.recovery.max_attempt_history == 0 {
            return Err(ConductorError::Config(
                "recovery.max_attempt_history must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Budget for an agent's initialize hook.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Budget for an agent's shutdown hook.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Pause between the shutdown and initialize halves of a restart.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Transitions retained per agent.
    #[serde(default = "default_lifecycle_history")]
    pub history_limit: usize,
}

impl LifecycleConfig {
    /// Initialize budget as a [`Duration`].
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Shutdown budget as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Restart pause as a [`Duration`].
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_init_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            history_limit: default_lifecycle_history(),
        }
    }
}

/// Task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backlog capacity per agent.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Completed executions retained per agent.
    #[serde(default = "default_max_completed")]
    pub max_completed: usize,
    /// Execution budget for tasks without their own timeout.
    #[serde(default = "default_task_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Interval between admission passes.
    #[serde(default = "default_queue_poll_ms")]
    pub poll_interval_ms: u64,
    /// Priority for tasks with no explicit, table or rule-based priority.
    #[serde(default = "default_priority")]
    pub default_priority: u8,
}

impl QueueConfig {
    /// Default execution budget as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Admission interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn validate(&self) -> ConductorResult<()> {
        if self.max_queue_size == 0 || self.max_completed == 0 {
            return Err(ConductorError::Config(
                "queue capacities must be > 0".into(),
            ));
        }
        if self.poll_interval_ms == 0 || self.default_timeout_ms == 0 {
            return Err(ConductorError::Config(
                "queue intervals must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_completed: default_max_completed(),
            default_timeout_ms: default_task_timeout_ms(),
            poll_interval_ms: default_queue_poll_ms(),
            default_priority: default_priority(),
        }
    }
}

/// Prioritizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritizerConfig {
    /// Priority for tasks no rule matches.
    #[serde(default = "default_priority")]
    pub base_priority: u8,
    /// Lower clamp for every computed priority.
    #[serde(default = "default_min_priority")]
    pub min_priority: u8,
    /// Upper clamp for every computed priority.
    #[serde(default = "default_max_priority")]
    pub max_priority: u8,
    /// Apply load, aging and preference adjustments.
    #[serde(default = "default_true")]
    pub dynamic_adjustment: bool,
    /// Subtracted when load is above `high_load`.
    #[serde(default = "default_step")]
    pub decay_step: u8,
    /// Added when load is below `low_load`, and once per aging interval waited.
    #[serde(default = "default_step")]
    pub boost_step: u8,
    /// Load fraction above which priorities decay.
    #[serde(default = "default_high_load")]
    pub high_load: f64,
    /// Load fraction below which priorities are boosted.
    #[serde(default = "default_low_load")]
    pub low_load: f64,
    /// Waiting time that earns one aging boost.
    #[serde(default = "default_aging_minutes")]
    pub aging_interval_minutes: u32,
    /// Priority records retained per task.
    #[serde(default = "default_priority_history")]
    pub history_limit: usize,
    /// Tasks with retained priority records; the oldest task is forgotten first.
    #[serde(default = "default_tracked_tasks")]
    pub max_tracked_tasks: usize,
    /// Task type to priority delta.
    #[serde(default)]
    pub user_preferences: HashMap<String, i32>,
}

impl PrioritizerConfig {
    pub(crate) fn validate(&self) -> ConductorResult<()> {
        if self.min_priority > self.max_priority {
            return Err(ConductorError::Config(format!(
                "prioritizer.min_priority ({}) exceeds max_priority ({})",
                self.min_priority, self.max_priority
            )));
        }
        if self.low_load >= self.high_load {
            return Err(ConductorError::Config(
                "prioritizer.low_load must be below high_load".into(),
            ));
        }
        if self.aging_interval_minutes == 0
            || self.history_limit == 0
            || self.max_tracked_tasks == 0
        {
            return Err(ConductorError::Config(
                "prioritizer aging interval and history limits must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            base_priority: default_priority(),
            min_priority: default_min_priority(),
            max_priority: default_max_priority(),
            dynamic_adjustment: true,
            decay_step: default_step(),
            boost_step: default_step(),
            high_load: default_high_load(),
            low_load: default_low_load(),
            aging_interval_minutes: default_aging_minutes(),
            history_limit: default_priority_history(),
            max_tracked_tasks: default_tracked_tasks(),
            user_preferences: HashMap::new(),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cap on live (non-terminal) schedules.
    #[serde(default = "default_max_scheduled")]
    pub max_scheduled_tasks: usize,
    /// Interval of the safety-net sweep for overdue tasks.
    #[serde(default = "default_scheduler_poll_ms")]
    pub poll_interval_ms: u64,
    /// Finished schedules kept for inspection; the oldest are evicted first.
    #[serde(default = "default_finished_retained")]
    pub max_finished_retained: usize,
}

impl SchedulerConfig {
    /// Sweep interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn validate(&self) -> ConductorResult<()> {
        if self.max_scheduled_tasks == 0 || self.poll_interval_ms == 0 {
            return Err(ConductorError::Config(
                "scheduler capacity and poll interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_scheduled_tasks: default_max_scheduled(),
            poll_interval_ms: default_scheduler_poll_ms(),
            max_finished_retained: default_finished_retained(),
        }
    }
}

/// Communication bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages retained per recipient.
    #[serde(default = "default_bus_history")]
    pub max_history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_history: default_bus_history(),
        }
    }
}

/// Error recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Attempts retained per agent.
    #[serde(default = "default_attempt_history")]
    pub max_attempt_history: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempt_history: default_attempt_history(),
        }
    }
}

fn default_init_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}
fn default_restart_delay_ms() -> u64 {
    1_000
}
fn default_lifecycle_history() -> usize {
    50
}
fn default_max_queue_size() -> usize {
    1_000
}
fn default_max_completed() -> usize {
    100
}
fn default_task_timeout_ms() -> u64 {
    300_000
}
fn default_queue_poll_ms() -> u64 {
    1_000
}
fn default_priority() -> u8 {
    5
}
fn default_min_priority() -> u8 {
    1
}
fn default_max_priority() -> u8 {
    10
}
fn default_true() -> bool {
    true
}
fn default_step() -> u8 {
    1
}
fn default_high_load() -> f64 {
    0.8
}
fn default_low_load() -> f64 {
    0.3
}
fn default_aging_minutes() -> u32 {
    30
}
fn default_priority_history() -> usize {
    100
}
fn default_tracked_tasks() -> usize {
    1_000
}
fn default_max_scheduled() -> usize {
    1_000
}
fn default_scheduler_poll_ms() -> u64 {
    60_000
}
fn default_finished_retained() -> usize {
    1_000
}
fn default_bus_history() -> usize {
    1_000
}
fn default_attempt_history() -> usize {
    100
}
