//! Agent task orchestration engine.
//!
//! Drives a fleet of agents supplied by the host: lifecycle transitions,
//! per-agent task queues with timeout-bounded execution, rule-based task
//! prioritization, time-triggered scheduling, inter-agent messaging and
//! pluggable failure recovery.
//!
//! # Main types
//!
//! - [`ConductorEngine`] — Builds every component from one [`ConductorConfig`] and wires them together.
//! - [`AgentLifecycleManager`] — Initialize, pause, resume, shut down and restart agents.
//! - [`TaskQueue`] — Per-agent backlogs executed one task at a time per agent.
//! - [`TaskPrioritizer`] — Rule-based, load-aware priority scoring.
//! - [`TaskScheduler`] — Once, recurring and cron schedules feeding a [`TaskSink`].
//! - [`CommunicationBus`] — Point-to-point and topic messaging between agents.
//! - [`ErrorRecovery`] — Priority-ordered recovery strategies.

/// Inter-agent messaging.
pub mod bus;
/// Engine configuration.
pub mod config;
/// Engine facade wiring the components together.
pub mod engine;
/// Observer channels shared by the components.
pub mod events;
/// Agent lifecycle state machine.
pub mod lifecycle;
/// Task priority rules and scoring.
pub mod prioritizer;
/// Failure recovery strategies.
pub mod recovery;
/// Time-triggered task scheduling.
pub mod scheduler;
/// Per-agent task queues and execution.
pub mod task_queue;
/// Tracing subscriber setup.
pub mod telemetry;

pub use bus::{handler_fn, BusEvent, CommunicationBus, Message, MessageFilter, MessageHandler};
pub use config::{
    BusConfig, ConductorConfig, LifecycleConfig, PrioritizerConfig, QueueConfig, RecoveryConfig,
    SchedulerConfig,
};
pub use engine::{Collaborators, ConductorEngine};
pub use events::EventBus;
pub use lifecycle::{
    AgentLifecycle, AgentLifecycleManager, LifecycleEvent, LifecycleMetrics, LifecycleState,
    StateTransition,
};
pub use prioritizer::{
    LoadRange, PriorityContext, PriorityPredicate, PriorityRecord, PriorityRule, PrioritizerEvent,
    RuleCondition, RuleConditions, RuleUpdate, TaskPrioritizer, TimeWindow,
};
pub use recovery::{
    ErrorRecovery, RecoveryAttempt, RecoveryContext, RecoveryEvent, RecoveryOutcome,
    RecoveryStats, RecoveryStrategy, ResetStrategy, RestartStrategy, RetryStrategy,
};
pub use scheduler::{
    ScheduleStatus, ScheduleUpdate, ScheduledTask, SchedulerEvent, TaskSchedule, TaskScheduler,
    TaskSink,
};
pub use task_queue::{QueueEvent, QueueStats, TaskExecution, TaskQueue};
pub use telemetry::init_tracing;
