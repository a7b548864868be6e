use thiserror::Error;

/// Engine error taxonomy.
///
/// Illegal-argument and not-found conditions surface to the immediate caller
/// and are never retried. Handler failures feed the job retry policy. Stale
/// entities are an expected race outcome, absorbed by the command runner.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("query matched {count} results where at most one was expected")]
    AmbiguousResult { count: usize },

    #[error("stale {kind}: {id}")]
    StaleEntity { kind: &'static str, id: String },

    #[error("invalid process model: {0}")]
    InvalidModel(String),

    #[error("no outgoing transition matched at node '{node}'")]
    NoTransition { node: String },

    #[error("{kind} {id} is suspended")]
    Suspended { kind: &'static str, id: String },

    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
}

impl EngineError {
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        EngineError::IllegalArgument(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        EngineError::IllegalState(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn stale(kind: &'static str, id: impl std::fmt::Display) -> Self {
        EngineError::StaleEntity {
            kind,
            id: id.to_string(),
        }
    }

    /// True for the concurrency failures the command runner may retry.
    pub fn is_stale(&self) -> bool {
        matches!(self, EngineError::StaleEntity { .. })
    }
}

/// A coded business failure thrown by a task delegate.
///
/// The code is matched against declared error boundaries; uncaught codes
/// propagate like any other handler failure.
#[derive(Debug, Error)]
#[error("business error {code}: {message}")]
pub struct BusinessError {
    pub code: String,
    pub message: String,
}

impl BusinessError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
