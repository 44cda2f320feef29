use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Status of a task as it moves through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in an agent's backlog.
    Pending,
    /// Currently executing against its agent.
    Running,
    /// The agent returned a result.
    Completed,
    /// The agent returned an error.
    Failed,
    /// The execution exceeded its time budget.
    Timeout,
    /// Removed by an explicit cancel.
    Canceled,
}

impl TaskStatus {
    /// Whether no further transitions can happen from this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// A unit of work targeted at one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub id: Uuid,
    /// Agent that executes the task.
    pub agent_id: String,
    /// Kind of work, matched by priority tables and rules.
    pub task_type: String,
    /// Opaque input for the agent.
    pub payload: serde_json::Value,
    /// Explicit priority; overrides any type-table or rule-based score.
    #[serde(default)]
    pub priority: Option<u8>,
    /// Execution budget in milliseconds; the queue default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Creation time; prioritization ages tasks from here.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Pending task with no explicit priority or timeout.
    pub fn new(
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            payload,
            priority: None,
            timeout_ms: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Pin an explicit priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set a per-task execution budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// The task's own timeout, if it carries one.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
