//! Dependency edges between tasks.
//!
//! Edges are stored as their own records so they can be written before the
//! predecessor task exists. Such an edge is a placeholder: it blocks its task
//! until it is rewritten with a real `dependency_task_id`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{DependencyId, TaskId};

/// A "must complete before" edge from `task_id` to `dependency_task_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub id: DependencyId,
    pub code: Uuid,
    pub last_change_code: Uuid,
    /// The dependent task.
    pub task_id: TaskId,
    /// The required predecessor. `None` only while the edge is a placeholder.
    pub dependency_task_id: Option<TaskId>,
    pub is_placeholder: bool,
}

impl TaskDependency {
    /// Whether the edge names a concrete predecessor.
    pub fn is_resolved(&self) -> bool {
        !self.is_placeholder && self.dependency_task_id.is_some()
    }
}

/// Insert payload for a new edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaskDependency {
    pub task_id: TaskId,
    pub dependency_task_id: Option<TaskId>,
    pub is_placeholder: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_edge_is_unresolved_even_with_target() {
        let mut edge = TaskDependency {
            id: DependencyId(1),
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            task_id: TaskId(2),
            dependency_task_id: Some(TaskId(1)),
            is_placeholder: true,
        };
        assert!(!edge.is_resolved());

        edge.is_placeholder = false;
        assert!(edge.is_resolved());

        edge.dependency_task_id = None;
        assert!(!edge.is_resolved());
    }
}
