use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid search specification: {0}")]
    InvalidSpec(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("No healthy proxy available: {0}")]
    NoHealthyProxy(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Persistence errors are the only class the orchestrator retries in place.
    pub fn is_persistence(&self) -> bool {
        matches!(self, EngineError::Persistence(_) | EngineError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
