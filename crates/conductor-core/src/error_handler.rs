use crate::error::ConductorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Where a failure happened, forwarded alongside the error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Agent the failure belongs to.
    pub agent_id: String,
    /// Component that observed it, e.g. `TaskQueue`.
    pub component: String,
    /// Operation that failed, e.g. `execute_task`.
    pub operation: String,
    /// Id of the task, schedule or message the failure belongs to.
    pub correlation_id: Option<String>,
}

impl ErrorContext {
    /// Context without a correlation id.
    pub fn new(
        agent_id: impl Into<String>,
        component: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            component: component.into(),
            operation: operation.into(),
            correlation_id: None,
        }
    }

    /// Attach the id of the task, schedule or message involved.
    pub fn with_correlation(mut self, id: impl ToString) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }
}

/// Shared error-handling collaborator that receives execution failures.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Handle one failure. Implementations must not panic.
    async fn handle_error(&self, error: &ConductorError, context: ErrorContext);
}

/// Error handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorHandler;

#[async_trait]
impl ErrorHandler for TracingErrorHandler {
    async fn handle_error(&self, err: &ConductorError, context: ErrorContext) {
        error!(
            agent_id = %context.agent_id,
            component = %context.component,
            operation = %context.operation,
            correlation_id = context.correlation_id.as_deref().unwrap_or("-"),
            kind = err.kind(),
            error = %err,
            "Unhandled engine failure"
        );
    }
}
