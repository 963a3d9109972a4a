use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Flow timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of a single step invocation. Captured by the engine, never
/// propagated out of a flow run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Step execution limit of {limit} reached")]
    ExecutionLimit { limit: usize },

    #[error("Cancelled")]
    Cancelled,
}

impl StepError {
    /// Shorthand used by step handlers.
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::ExecutionFailed(message.into())
    }
}

/// Rejected configuration. Raised before any state is mutated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow already registered: {0}")]
    DuplicateFlow(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Step already registered: {0}")]
    DuplicateStep(String),

    #[error("Flow '{0}' has no start steps")]
    NoStartSteps(String),

    #[error("Dependency {dependency} -> {dependent} would create a cycle")]
    CyclicDependency {
        dependency: String,
        dependent: String,
    },

    #[error("Flow {flow} cannot move from {from} to {to}")]
    InvalidTransition {
        flow: String,
        from: String,
        to: String,
    },

    #[error("Execution plan contains no flows")]
    EmptyPlan,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
