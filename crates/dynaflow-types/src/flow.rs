//! Flow records: a requested, possibly multi-task unit of work.
//!
//! Flows form a hierarchy through `parent_flow_id`, with `root_flow_id`
//! pointing at the top of the tree. Relations are plain id references resolved
//! through the store; there are no in-memory back-pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;

use crate::ids::{FlowId, FlowTypeId, OwnerId};

/// A persisted flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    /// Stable public identity.
    pub code: Uuid,
    /// Version token, replaced by the store on every successful update.
    pub last_change_code: Uuid,
    pub owner_id: OwnerId,
    pub type_id: FlowTypeId,
    pub description: String,
    /// Lower values are served first.
    pub priority_level: i32,
    pub parent_flow_id: Option<FlowId>,
    /// Set once at creation: the parent's root, or this flow's own id.
    pub root_flow_id: FlowId,
    /// Task creation may not start until this flow completed successfully.
    pub dependency_flow_id: Option<FlowId>,
    /// Business entity this flow concerns.
    pub subject_code: Option<Uuid>,
    pub param1: Option<String>,

    pub requested_at: DateTime<Utc>,
    pub min_start_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub is_paused: bool,
    pub is_cancel_requested: bool,
    pub is_canceled: bool,
    pub is_started: bool,
    pub is_completed: bool,
    pub is_successful: bool,
    pub is_resubmitted: bool,
    pub is_task_creation_started: bool,
    pub is_tasks_created: bool,

    pub is_build_task_debug_required: bool,
    pub is_run_task_debug_required: bool,

    /// Claim token for the task-creation step.
    pub task_creation_processor_identifier: Option<String>,
    /// Terminal output or error payload. Meaningful only once terminal.
    pub result_value: Option<String>,
}

impl Flow {
    /// Completed (successfully or not) or canceled.
    pub fn is_terminal(&self) -> bool {
        self.is_completed || self.is_canceled
    }

    /// Completed and successful: the only state that satisfies a dependency.
    pub fn is_succeeded(&self) -> bool {
        self.is_completed && self.is_successful && !self.is_canceled
    }

    /// Apply the canceled terminal state. `is_completed` follows `is_started`.
    pub fn mark_canceled(&mut self, now: DateTime<Utc>) {
        self.is_cancel_requested = true;
        self.is_canceled = true;
        self.is_successful = false;
        self.is_completed = self.is_started;
        self.completed_at = Some(now);
    }

    /// Coarse lifecycle state derived from the status flags.
    pub fn status(&self) -> FlowStatus {
        if self.is_canceled {
            FlowStatus::Canceled
        } else if self.is_completed && self.is_successful {
            FlowStatus::Succeeded
        } else if self.is_completed {
            FlowStatus::Failed
        } else if self.is_paused {
            FlowStatus::Paused
        } else if self.is_started {
            FlowStatus::Started
        } else {
            FlowStatus::Requested
        }
    }
}

/// Insert payload for a new flow. The store assigns `id`, `code` and the
/// version token.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFlow {
    pub owner_id: OwnerId,
    pub type_id: FlowTypeId,
    pub description: String,
    pub priority_level: i32,
    pub parent_flow_id: Option<FlowId>,
    /// `None` means "this flow is its own root"; the store fills in the new id.
    pub root_flow_id: Option<FlowId>,
    pub dependency_flow_id: Option<FlowId>,
    pub subject_code: Option<Uuid>,
    pub param1: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub min_start_at: DateTime<Utc>,
    pub is_build_task_debug_required: bool,
    pub is_run_task_debug_required: bool,
    /// Set when the creator builds the tasks itself. The flow is stored with
    /// its task-creation step already claimed, so processors skip it.
    pub task_creation_processor_identifier: Option<String>,
}

/// Lifecycle state of a flow or task, for display and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Requested,
    Paused,
    Started,
    Succeeded,
    Failed,
    Canceled,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStatus::Requested => write!(f, "requested"),
            FlowStatus::Paused => write!(f, "paused"),
            FlowStatus::Started => write!(f, "started"),
            FlowStatus::Succeeded => write!(f, "succeeded"),
            FlowStatus::Failed => write!(f, "failed"),
            FlowStatus::Canceled => write!(f, "canceled"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_flow() -> Flow {
        let now = Utc::now();
        Flow {
            id: FlowId(1),
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            owner_id: OwnerId(1),
            type_id: FlowTypeId(1),
            description: "nightly import".to_string(),
            priority_level: 5,
            parent_flow_id: None,
            root_flow_id: FlowId(1),
            dependency_flow_id: None,
            subject_code: None,
            param1: None,
            requested_at: now,
            min_start_at: now,
            started_at: None,
            completed_at: None,
            is_paused: false,
            is_cancel_requested: false,
            is_canceled: false,
            is_started: false,
            is_completed: false,
            is_successful: false,
            is_resubmitted: false,
            is_task_creation_started: false,
            is_tasks_created: false,
            is_build_task_debug_required: false,
            is_run_task_debug_required: false,
            task_creation_processor_identifier: None,
            result_value: None,
        }
    }

    #[test]
    fn status_follows_flags() {
        let mut flow = sample_flow();
        assert_eq!(flow.status(), FlowStatus::Requested);

        flow.is_paused = true;
        assert_eq!(flow.status(), FlowStatus::Paused);

        flow.is_paused = false;
        flow.is_started = true;
        assert_eq!(flow.status(), FlowStatus::Started);

        flow.is_completed = true;
        assert_eq!(flow.status(), FlowStatus::Failed);
        assert!(flow.is_terminal());
        assert!(!flow.is_succeeded());

        flow.is_successful = true;
        assert_eq!(flow.status(), FlowStatus::Succeeded);
        assert!(flow.is_succeeded());
    }

    #[test]
    fn mark_canceled_keeps_completion_tied_to_start() {
        let mut pending = sample_flow();
        pending.mark_canceled(Utc::now());
        assert!(pending.is_canceled && !pending.is_completed && !pending.is_successful);
        assert!(pending.completed_at.is_some());

        let mut running = sample_flow();
        running.is_started = true;
        running.mark_canceled(Utc::now());
        assert!(running.is_completed);
        assert_eq!(running.status(), FlowStatus::Canceled);
    }

    #[test]
    fn canceled_wins_over_other_flags() {
        let mut flow = sample_flow();
        flow.is_started = true;
        flow.is_canceled = true;
        assert_eq!(flow.status(), FlowStatus::Canceled);
        assert!(flow.is_terminal());
        assert_eq!(flow.status().to_string(), "canceled");
    }
}
