use thiserror::Error;

/// Errors from store operations (used by the `FlowStore` port in dynaflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// Busy database, dropped connection, pool timeout. Safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),
}

impl RepositoryError {
    /// Whether the caller may retry the same operation after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Connection | RepositoryError::Transient(_))
    }
}

/// A create request rejected before anything was persisted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown flow type '{0}'")]
    UnknownFlowType(String),

    #[error("unknown task type '{0}'")]
    UnknownTaskType(String),

    #[error("type '{0}' is inactive")]
    InactiveType(String),

    #[error("owner id must be positive")]
    InvalidOwner,

    #[error("referenced flow {0} does not exist")]
    MissingFlow(i64),

    #[error("referenced task {0} does not exist")]
    MissingTask(i64),

    #[error("flow {flow} belongs to owner {actual}, expected {expected}")]
    OwnerMismatch { flow: i64, expected: i64, actual: i64 },

    #[error("task {task} belongs to flow {actual}, expected {expected}")]
    ForeignTask { task: i64, expected: i64, actual: i64 },

    #[error("flow {0} has not finished")]
    FlowNotTerminal(i64),

    #[error("frequency must be between 1 and {} hours", crate::schedule::MAX_FREQUENCY_IN_HOURS)]
    InvalidFrequency,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RepositoryError::Connection.is_transient());
        assert!(RepositoryError::Transient("database is locked".into()).is_transient());
        assert!(!RepositoryError::NotFound.is_transient());
        assert!(!RepositoryError::Query("bad".into()).is_transient());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::OwnerMismatch {
            flow: 3,
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.to_string(), "flow 3 belongs to owner 2, expected 1");
    }
}
