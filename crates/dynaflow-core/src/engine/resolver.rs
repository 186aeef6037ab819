//! Dependency resolution for candidate tasks.
//!
//! A task's predecessors are its declared `dependency_task_id` plus every
//! dependency edge recorded for it. The task is ready only when every
//! predecessor completed successfully. A predecessor that failed or was
//! canceled can never succeed, which dooms the dependent.

use dynaflow_types::dependency::TaskDependency;
use dynaflow_types::error::RepositoryError;
use dynaflow_types::ids::TaskId;
use dynaflow_types::task::Task;

use crate::repository::FlowStore;

/// Whether a task may be claimed now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// Every predecessor succeeded.
    Ready,
    /// Some predecessor is pending, missing, or still a placeholder.
    Blocked,
    /// Some predecessor reached a terminal state without succeeding.
    Doomed { predecessor: TaskId },
}

impl Eligibility {
    pub fn is_ready(&self) -> bool {
        matches!(self, Eligibility::Ready)
    }
}

pub struct DependencyResolver;

impl DependencyResolver {
    /// Evaluate `task` against the current store state.
    pub async fn evaluate<S: FlowStore>(store: &S, task: &Task) -> Result<Eligibility, RepositoryError> {
        let edges = store.list_dependencies_for_task(task.id).await?;

        let mut predecessors: Vec<TaskId> = task.dependency_task_id.into_iter().collect();
        let mut blocked = false;
        for edge in &edges {
            match Self::edge_target(edge) {
                Some(id) => predecessors.push(id),
                None => blocked = true,
            }
        }
        predecessors.sort();
        predecessors.dedup();

        for id in predecessors {
            match store.get_task(id).await? {
                Some(dep) => match Self::classify(&dep) {
                    Eligibility::Ready => {}
                    Eligibility::Blocked => blocked = true,
                    doomed @ Eligibility::Doomed { .. } => return Ok(doomed),
                },
                None => blocked = true,
            }
        }

        Ok(if blocked {
            Eligibility::Blocked
        } else {
            Eligibility::Ready
        })
    }

    /// Shorthand for `evaluate(..).is_ready()`.
    pub async fn is_eligible<S: FlowStore>(store: &S, task: &Task) -> Result<bool, RepositoryError> {
        Ok(Self::evaluate(store, task).await?.is_ready())
    }

    /// Concrete predecessor of an edge, or `None` while it is unresolved.
    fn edge_target(edge: &TaskDependency) -> Option<TaskId> {
        if edge.is_resolved() {
            edge.dependency_task_id
        } else {
            None
        }
    }

    /// How a single predecessor affects its dependent.
    fn classify(predecessor: &Task) -> Eligibility {
        if predecessor.is_succeeded() {
            Eligibility::Ready
        } else if predecessor.is_terminal() {
            Eligibility::Doomed {
                predecessor: predecessor.id,
            }
        } else {
            Eligibility::Blocked
        }
    }
}
