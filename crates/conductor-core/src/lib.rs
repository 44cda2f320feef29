//! Core types and collaborator contracts for the Conductor agent engine.
//!
//! This crate holds everything the orchestration components share: the error
//! type, the [`Task`] model, and the traits a host application implements to
//! plug agents, monitoring, state storage and error handling into the engine.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for every engine component.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`Task`] — A unit of work targeted at one agent.
//! - [`Agent`] / [`AgentRegistry`] — The workers being orchestrated and their lookup.
//! - [`MonitoringService`] / [`AlertManager`] — Metric and alert sinks.
//! - [`StateManager`] — Agent state store used by recovery.
//! - [`ErrorHandler`] — Receives execution failures with structured context.

/// Agent contract and registry.
pub mod agent;
/// Error types.
pub mod error;
/// Shared error-handling collaborator.
pub mod error_handler;
/// Metrics and alerting contracts.
pub mod monitoring;
/// Agent state storage contract.
pub mod state;
/// Task model.
pub mod task;

pub use agent::{Agent, AgentRegistry, InMemoryAgentRegistry};
pub use error::{ConductorError, ConductorResult};
pub use error_handler::{ErrorContext, ErrorHandler, TracingErrorHandler};
pub use monitoring::{
    Alert, AlertManager, AlertRecord, AlertSeverity, InMemoryMonitoring, Metric, MonitoringService,
};
pub use state::{AgentState, InMemoryStateManager, StateChange, StateManager};
pub use task::{Task, TaskStatus};
