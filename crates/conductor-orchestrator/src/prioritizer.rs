use crate::config::PrioritizerConfig;
use crate::events::EventBus;
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use conductor_core::{ConductorError, ConductorResult, Task};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Inclusive clock window in `HH:MM` form. A window whose start is after its
/// end wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Window start, `HH:MM`.
    pub start: String,
    /// Window end, `HH:MM`.
    pub end: String,
}

impl TimeWindow {
    /// Window from `start` to `end`.
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    fn bounds(&self) -> ConductorResult<(NaiveTime, NaiveTime)> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map_err(|e| ConductorError::Config(format!("Invalid time '{s}': {e}")))
        };
        Ok((parse(&self.start)?, parse(&self.end)?))
    }

    fn contains(&self, at: NaiveTime) -> bool {
        match self.bounds() {
            Ok((start, end)) if start <= end => at >= start && at <= end,
            Ok((start, end)) => at >= start || at <= end,
            Err(_) => false,
        }
    }
}

/// Inclusive load range in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl LoadRange {
    /// Range from `min` to `max`.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn contains(&self, load: f64) -> bool {
        load >= self.min && load <= self.max
    }
}

/// Field-match conditions. Every set field must match; empty sets and `None`
/// fields are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    /// Task types the rule applies to.
    #[serde(default)]
    pub task_types: Vec<String>,
    /// Agent types the rule applies to.
    #[serde(default)]
    pub agent_types: Vec<String>,
    /// Agent statuses the rule applies to.
    #[serde(default)]
    pub agent_statuses: Vec<String>,
    /// Clock window the rule applies in.
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    /// Weekdays the rule applies on.
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
    /// System load range the rule applies in.
    #[serde(default)]
    pub system_load: Option<LoadRange>,
    /// Agent load range the rule applies in.
    #[serde(default)]
    pub agent_load: Option<LoadRange>,
}

impl RuleConditions {
    /// Conditions matching only the given task types.
    pub fn task_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            task_types: types.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    fn matches(&self, task: &Task, ctx: &PriorityContext) -> bool {
        let in_set = |set: &[String], value: Option<&str>| {
            set.is_empty() || value.is_some_and(|v| set.iter().any(|s| s == v))
        };
        let in_range =
            |range: &Option<LoadRange>, load: Option<f64>| match (range, load) {
                (None, _) => true,
                (Some(range), Some(load)) => range.contains(load),
                (Some(_), None) => false,
            };

        in_set(&self.task_types, Some(task.task_type.as_str()))
            && in_set(&self.agent_types, ctx.agent_type.as_deref())
            && in_set(&self.agent_statuses, ctx.agent_status.as_deref())
            && self
                .time_window
                .as_ref()
                .map_or(true, |w| w.contains(ctx.now.time()))
            && (self.days_of_week.is_empty() || self.days_of_week.contains(&ctx.now.weekday()))
            && in_range(&self.system_load, ctx.system_load)
            && in_range(&self.agent_load, ctx.agent_load)
    }
}

/// Arbitrary rule predicate.
pub type PriorityPredicate = Arc<dyn Fn(&Task, &PriorityContext) -> bool + Send + Sync>;

/// When a rule applies.
#[derive(Clone)]
pub enum RuleCondition {
    /// Declarative field matches; serializable.
    Fields(RuleConditions),
    /// Code predicate for anything the fields cannot express.
    Predicate(PriorityPredicate),
}

impl RuleCondition {
    fn matches(&self, task: &Task, ctx: &PriorityContext) -> bool {
        match self {
            RuleCondition::Fields(conditions) => conditions.matches(task, ctx),
            RuleCondition::Predicate(predicate) => predicate(task, ctx),
        }
    }
}

impl std::fmt::Debug for RuleCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleCondition::Fields(conditions) => f.debug_tuple("Fields").field(conditions).finish(),
            RuleCondition::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A prioritization rule: the first active rule whose condition matches
/// assigns its priority.
#[derive(Debug, Clone)]
pub struct PriorityRule {
    /// Rule id.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// When the rule applies.
    pub condition: RuleCondition,
    /// Priority the rule assigns.
    pub priority: u8,
    /// Inactive rules are skipped.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl PriorityRule {
    /// Active rule with a fresh id.
    pub fn new(name: impl Into<String>, condition: RuleCondition, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            condition,
            priority,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied by [`TaskPrioritizer::update_rule`].
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    /// New name.
    pub name: Option<String>,
    /// New condition.
    pub condition: Option<RuleCondition>,
    /// New priority; must stay within the configured range.
    pub priority: Option<u8>,
    /// Enable or disable the rule.
    pub active: Option<bool>,
}

/// Facts about the agent and the system the rules are evaluated against.
#[derive(Debug, Clone)]
pub struct PriorityContext {
    /// Type of the target agent.
    pub agent_type: Option<String>,
    /// Status of the target agent.
    pub agent_status: Option<String>,
    /// Agent backlog as a fraction of capacity.
    pub agent_load: Option<f64>,
    /// Total backlog as a fraction of total capacity.
    pub system_load: Option<f64>,
    /// Evaluation time, used by windows, weekdays and aging.
    pub now: DateTime<Utc>,
}

impl PriorityContext {
    /// Empty context evaluated at the current time.
    pub fn new() -> Self {
        Self {
            agent_type: None,
            agent_status: None,
            agent_load: None,
            system_load: None,
            now: Utc::now(),
        }
    }

    /// Set the agent type.
    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Set the agent status.
    pub fn with_agent_status(mut self, status: impl Into<String>) -> Self {
        self.agent_status = Some(status.into());
        self
    }

    /// Set the agent load fraction.
    pub fn with_agent_load(mut self, load: f64) -> Self {
        self.agent_load = Some(load);
        self
    }

    /// Set the system load fraction.
    pub fn with_system_load(mut self, load: f64) -> Self {
        self.system_load = Some(load);
        self
    }

    /// Evaluate at `now` instead of the current time.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

impl Default for PriorityContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One priority decision for a task.
#[derive(Debug, Clone, Serialize)]
pub struct PriorityRecord {
    /// Assigned priority.
    pub priority: u8,
    /// Rule that matched, if any.
    pub rule_id: Option<Uuid>,
    /// Time of assignment.
    pub at: DateTime<Utc>,
}

/// Notifications published by the prioritizer.
#[derive(Debug, Clone)]
pub enum PrioritizerEvent {
    /// A rule was added.
    RuleAdded {
        /// New rule.
        rule_id: Uuid,
    },
    /// A rule was changed.
    RuleUpdated {
        /// Changed rule.
        rule_id: Uuid,
    },
    /// A rule was deleted.
    RuleDeleted {
        /// Deleted rule.
        rule_id: Uuid,
    },
    /// A task received a new priority.
    PriorityAssigned {
        /// Scored task.
        task_id: Uuid,
        /// Assigned priority.
        priority: u8,
    },
}

/// Per-task priority records, with tasks evicted oldest first.
#[derive(Default)]
struct PriorityLedger {
    by_task: HashMap<Uuid, VecDeque<PriorityRecord>>,
    order: VecDeque<Uuid>,
}

impl PriorityLedger {
    fn last_priority(&self, task_id: Uuid) -> Option<u8> {
        self.by_task.get(&task_id)?.back().map(|r| r.priority)
    }

    fn push(&mut self, task_id: Uuid, record: PriorityRecord, per_task: usize, tasks: usize) {
        if !self.by_task.contains_key(&task_id) {
            self.order.push_back(task_id);
        }
        let entries = self.by_task.entry(task_id).or_default();
        entries.push_back(record);
        while entries.len() > per_task {
            entries.pop_front();
        }
        while self.by_task.len() > tasks {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.by_task.remove(&oldest);
        }
    }
}

/// Rule-based, load-aware task prioritization.
pub struct TaskPrioritizer {
    config: PrioritizerConfig,
    rules: RwLock<Vec<PriorityRule>>,
    preferences: RwLock<HashMap<String, i32>>,
    history: RwLock<PriorityLedger>,
    events: EventBus<PrioritizerEvent>,
}

impl TaskPrioritizer {
    /// Prioritizer with no rules.
    pub fn new(config: PrioritizerConfig) -> Self {
        let preferences = config.user_preferences.clone();
        Self {
            config,
            rules: RwLock::new(Vec::new()),
            preferences: RwLock::new(preferences),
            history: RwLock::new(PriorityLedger::default()),
            events: EventBus::default(),
        }
    }

    /// Receive rule changes and priority assignments.
    pub fn subscribe(&self) -> broadcast::Receiver<PrioritizerEvent> {
        self.events.subscribe()
    }

    /// Score a task against the rules and the current load.
    pub async fn prioritize_task(&self, task: &Task, ctx: &PriorityContext) -> u8 {
        let (priority, rule_id) = self.evaluate(task, ctx).await;
        debug!(task_id = %task.id, task_type = %task.task_type, priority, ?rule_id, "Task prioritized");
        self.record(task.id, priority, rule_id).await;
        self.events.publish(PrioritizerEvent::PriorityAssigned {
            task_id: task.id,
            priority,
        });
        priority
    }

    /// Score a task that is still waiting. History and observers only see
    /// the result when the priority moved.
    pub async fn rescore_task(&self, task: &Task, ctx: &PriorityContext) -> u8 {
        let (priority, rule_id) = self.evaluate(task, ctx).await;
        let previous = self.history.read().await.last_priority(task.id);
        if previous != Some(priority) {
            debug!(task_id = %task.id, ?previous, priority, "Task priority changed while waiting");
            self.record(task.id, priority, rule_id).await;
            self.events.publish(PrioritizerEvent::PriorityAssigned {
                task_id: task.id,
                priority,
            });
        }
        priority
    }

    async fn evaluate(&self, task: &Task, ctx: &PriorityContext) -> (u8, Option<Uuid>) {
        let (base, rule_id) = {
            let rules = self.rules.read().await;
            match rules.iter().find(|r| r.active && r.condition.matches(task, ctx)) {
                Some(rule) => (rule.priority, Some(rule.id)),
                None => (self.config.base_priority, None),
            }
        };

        let mut priority = i32::from(base);
        if self.config.dynamic_adjustment {
            priority += self.dynamic_adjustment(task, ctx).await;
        }
        (self.clamp(priority), rule_id)
    }

    /// Stable sort by priority (highest first), then creation time.
    pub fn reorder_queue(&self, mut tasks: Vec<Task>) -> Vec<Task> {
        let base = self.config.base_priority;
        tasks.sort_by(|a, b| {
            b.priority
                .unwrap_or(base)
                .cmp(&a.priority.unwrap_or(base))
                .then(a.created_at.cmp(&b.created_at))
        });
        tasks
    }

    /// Append a rule. Rules are evaluated in insertion order.
    pub async fn add_rule(&self, rule: PriorityRule) -> ConductorResult<Uuid> {
        self.validate(&rule)?;
        let id = rule.id;
        info!(rule_id = %id, name = %rule.name, priority = rule.priority, "Priority rule added");
        self.rules.write().await.push(rule);
        self.events.publish(PrioritizerEvent::RuleAdded { rule_id: id });
        Ok(id)
    }

    /// Look up a rule.
    pub async fn get_rule(&self, rule_id: Uuid) -> Option<PriorityRule> {
        self.rules
            .read()
            .await
            .iter()
            .find(|r| r.id == rule_id)
            .cloned()
    }

    /// Rules in evaluation order.
    pub async fn list_rules(&self) -> Vec<PriorityRule> {
        self.rules.read().await.clone()
    }

    /// Apply a partial update in place; the rule keeps its position.
    pub async fn update_rule(
        &self,
        rule_id: Uuid,
        update: RuleUpdate,
    ) -> ConductorResult<PriorityRule> {
        let updated = {
            let mut rules = self.rules.write().await;
            let rule = rules
                .iter_mut()
                .find(|r| r.id == rule_id)
                .ok_or_else(|| ConductorError::NotFound(format!("priority rule {rule_id}")))?;

            let mut candidate = rule.clone();
            if let Some(name) = update.name {
                candidate.name = name;
            }
            if let Some(condition) = update.condition {
                candidate.condition = condition;
            }
            if let Some(priority) = update.priority {
                candidate.priority = priority;
            }
            if let Some(active) = update.active {
                candidate.active = active;
            }
            self.validate(&candidate)?;
            candidate.updated_at = Utc::now();
            *rule = candidate.clone();
            candidate
        };
        self.events.publish(PrioritizerEvent::RuleUpdated { rule_id });
        Ok(updated)
    }

    /// Delete a rule. Returns `false` for unknown ids.
    pub async fn delete_rule(&self, rule_id: Uuid) -> bool {
        let removed = {
            let mut rules = self.rules.write().await;
            let before = rules.len();
            rules.retain(|r| r.id != rule_id);
            rules.len() != before
        };
        if removed {
            self.events.publish(PrioritizerEvent::RuleDeleted { rule_id });
        }
        removed
    }

    /// Set the priority delta applied to every task of `task_type`.
    pub async fn set_user_preference(&self, task_type: impl Into<String>, delta: i32) {
        self.preferences.write().await.insert(task_type.into(), delta);
    }

    /// Recorded priorities for a task, oldest first. Empty once the task is forgotten.
    pub async fn priority_history(&self, task_id: Uuid) -> Vec<PriorityRecord> {
        self.history
            .read()
            .await
            .by_task
            .get(&task_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn dynamic_adjustment(&self, task: &Task, ctx: &PriorityContext) -> i32 {
        let decay = i32::from(self.config.decay_step);
        let boost = i32::from(self.config.boost_step);
        let mut delta = 0;

        for load in [ctx.agent_load, ctx.system_load].into_iter().flatten() {
            if load > self.config.high_load {
                delta -= decay;
            } else if load < self.config.low_load {
                delta += boost;
            }
        }

        let waited_minutes = (ctx.now - task.created_at).num_minutes();
        if waited_minutes > 0 {
            let buckets = waited_minutes / i64::from(self.config.aging_interval_minutes);
            delta += boost.saturating_mul(i32::try_from(buckets).unwrap_or(i32::MAX));
        }

        if let Some(pref) = self.preferences.read().await.get(&task.task_type) {
            delta = delta.saturating_add(*pref);
        }
        delta
    }

    fn clamp(&self, priority: i32) -> u8 {
        let min = i32::from(self.config.min_priority);
        let max = i32::from(self.config.max_priority);
        // bounded by u8 limits
        priority.clamp(min, max) as u8
    }

    fn validate(&self, rule: &PriorityRule) -> ConductorResult<()> {
        if rule.priority < self.config.min_priority || rule.priority > self.config.max_priority {
            return Err(ConductorError::Config(format!(
                "rule priority {} outside [{}, {}]",
                rule.priority, self.config.min_priority, self.config.max_priority
            )));
        }
        if let RuleCondition::Fields(RuleConditions {
            time_window: Some(window),
            ..
        }) = &rule.condition
        {
            window.bounds()?;
        }
        Ok(())
    }

    async fn record(&self, task_id: Uuid, priority: u8, rule_id: Option<Uuid>) {
        let record = PriorityRecord {
            priority,
            rule_id,
            at: Utc::now(),
        };
        self.history.write().await.push(
            task_id,
            record,
            self.config.history_limit,
            self.config.max_tracked_tasks,
        );
    }
}
