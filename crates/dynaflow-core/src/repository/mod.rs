//! Store port definitions.
//!
//! `FlowStore` is the persistence boundary the engine is written against. The
//! infrastructure layer (dynaflow-infra) implements it with SQLite; `memory`
//! provides an in-process implementation for tests and embedding.

pub mod memory;
pub mod store;

use chrono::{DateTime, Utc};
use dynaflow_types::ids::{OwnerId, TaskTypeId};
use dynaflow_types::task::Task;
use uuid::Uuid;

pub use store::FlowStore;

/// Outcome of a version-checked update.
///
/// A lost race is an expected result during concurrent operation, so it is a
/// value rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionedUpdate {
    /// The write happened; carries the new version token.
    Applied(Uuid),
    /// The stored version differed from the expected one. Nothing was written.
    Stale,
}

impl VersionedUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, VersionedUpdate::Applied(_))
    }

    /// New version token when applied.
    pub fn version(&self) -> Option<Uuid> {
        match self {
            VersionedUpdate::Applied(v) => Some(*v),
            VersionedUpdate::Stale => None,
        }
    }
}

/// Parameters for the candidate-task query behind claim polling.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    /// Only tasks of flows owned by this tenant. `None` = all owners.
    pub owner_id: Option<OwnerId>,
    /// Tasks with `min_start_at` after this instant are not yet due.
    pub now: DateTime<Utc>,
    /// Processor capabilities: task types it has handlers for. `None` = any.
    pub task_type_ids: Option<Vec<TaskTypeId>>,
    pub limit: u32,
}

/// A task that passed the store-side filters, with the owning flow's priority.
///
/// Store-side filters: not started, not terminal, due, every predecessor
/// resolved and terminal, and the owning flow has finished task creation and is
/// not paused, cancel-requested or terminal. Tasks still waiting on a
/// predecessor never occupy the window. Whether a finished predecessor
/// succeeded, and parallel-run exclusion, are engine logic layered on top.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateTask {
    pub task: Task,
    pub flow_priority_level: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_update_accessors() {
        let v = Uuid::now_v7();
        assert!(VersionedUpdate::Applied(v).is_applied());
        assert_eq!(VersionedUpdate::Applied(v).version(), Some(v));
        assert!(!VersionedUpdate::Stale.is_applied());
        assert_eq!(VersionedUpdate::Stale.version(), None);
    }
}
