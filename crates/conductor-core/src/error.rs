use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor engine.
///
/// Variants follow the failure classes the engine distinguishes: capacity
/// rejections, failed lookups, exceeded time budgets, failures raised by an
/// agent's own capability, and failures raised by user-supplied handlers.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// A queue or table is at its configured maximum.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// A referenced agent, task, rule or strategy does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bounded operation exceeded its budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The agent's own capability rejected the work.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A subscriber, filter or recovery strategy failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Agent state is missing or unusable.
    #[error("State error: {0}")]
    State(String),

    /// A lifecycle transition is not allowed from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Configuration parsing or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Short, stable label for the error class, used in metrics metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            ConductorError::Capacity(_) => "capacity",
            ConductorError::NotFound(_) => "not_found",
            ConductorError::Timeout(_) => "timeout",
            ConductorError::Execution(_) => "execution",
            ConductorError::Handler(_) => "handler",
            ConductorError::State(_) => "state",
            ConductorError::InvalidTransition(_) => "invalid_transition",
            ConductorError::Config(_) => "config",
            ConductorError::Json(_) => "json",
            ConductorError::Io(_) => "io",
        }
    }
}
