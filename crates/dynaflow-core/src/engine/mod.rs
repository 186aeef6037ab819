//! The DynaFlow engine.
//!
//! Every component here talks to persistence only through [`FlowStore`] and
//! coordinates with other processors only through version-checked updates.
//!
//! [`FlowStore`]: crate::repository::FlowStore

pub mod builder;
pub mod cancellation;
pub mod catalog;
pub mod claimer;
pub mod completion;
pub mod debug_gate;
pub mod executor;
pub mod handler;
pub mod planner;
pub mod processor;
pub mod resolver;
pub mod retry;
pub mod trigger;
pub mod versioned;

use dynaflow_types::error::{RepositoryError, ValidationError};
use dynaflow_types::ids::{FlowId, TaskId};

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("flow not found: {0}")]
    FlowNotFound(FlowId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("tasks were already created for flow {0}")]
    TasksAlreadyCreated(FlowId),

    #[error("{entity} kept changing underneath us after {attempts} attempts")]
    ConflictRetriesExhausted { entity: String, attempts: u32 },

    #[error("planner error: {0}")]
    Planner(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Transient store failures may be retried by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Repository(e) if e.is_transient())
    }
}
