//! Task records: one executable step within a flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;

use crate::ids::{FlowId, TaskId, TaskTypeId};

/// A persisted task. Owned by exactly one flow for its whole life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub code: Uuid,
    /// Version token, replaced by the store on every successful update.
    pub last_change_code: Uuid,
    pub flow_id: FlowId,
    /// Copied from the owning flow's `subject_code` at build time.
    pub flow_subject_code: Option<Uuid>,
    pub type_id: TaskTypeId,
    pub description: String,
    /// Single declared predecessor. Further predecessors live in dependency edges.
    pub dependency_task_id: Option<TaskId>,
    pub max_retry_count: u32,
    /// Number of retries consumed so far; never exceeds `max_retry_count`.
    pub retry_count: u32,
    /// When false, at most one task of this type runs at a time within the flow.
    pub is_parallel_run_allowed: bool,

    pub requested_at: DateTime<Utc>,
    /// Do-not-start-before. Retries push this forward to apply backoff.
    pub min_start_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub is_cancel_requested: bool,
    pub is_canceled: bool,
    pub is_started: bool,
    pub is_completed: bool,
    pub is_successful: bool,
    pub is_resubmitted: bool,

    /// Current or last lease holder.
    pub processor_identifier: Option<String>,
    pub param1: Option<String>,
    pub param2: Option<String>,
    pub result_value: Option<String>,
}

impl Task {
    /// Completed (successfully or not) or canceled.
    pub fn is_terminal(&self) -> bool {
        self.is_completed || self.is_canceled
    }

    /// Completed and successful: the only state that satisfies a dependent.
    pub fn is_succeeded(&self) -> bool {
        self.is_completed && self.is_successful && !self.is_canceled
    }

    /// Leased and not yet finished.
    pub fn is_running(&self) -> bool {
        self.is_started && !self.is_terminal()
    }

    /// Retries still available after the current attempt.
    pub fn retries_remaining(&self) -> u32 {
        self.max_retry_count.saturating_sub(self.retry_count)
    }

    /// Apply the canceled terminal state. `is_completed` follows `is_started`.
    pub fn mark_canceled(&mut self, now: DateTime<Utc>) {
        self.is_cancel_requested = true;
        self.is_canceled = true;
        self.is_successful = false;
        self.is_completed = self.is_started;
        self.completed_at = Some(now);
    }

    pub fn status(&self) -> TaskStatus {
        if self.is_canceled {
            TaskStatus::Canceled
        } else if self.is_completed && self.is_successful {
            TaskStatus::Succeeded
        } else if self.is_completed {
            TaskStatus::Failed
        } else if self.is_started {
            TaskStatus::Running
        } else {
            TaskStatus::Pending
        }
    }
}

/// Insert payload for a new task. The store assigns identity and version.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub flow_id: FlowId,
    pub flow_subject_code: Option<Uuid>,
    pub type_id: TaskTypeId,
    pub description: String,
    pub dependency_task_id: Option<TaskId>,
    pub max_retry_count: u32,
    pub is_parallel_run_allowed: bool,
    pub requested_at: DateTime<Utc>,
    pub min_start_at: DateTime<Utc>,
    pub param1: Option<String>,
    pub param2: Option<String>,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            id: TaskId(10),
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            flow_id: FlowId(1),
            flow_subject_code: None,
            type_id: TaskTypeId(3),
            description: "load rows".to_string(),
            dependency_task_id: None,
            max_retry_count: 2,
            retry_count: 0,
            is_parallel_run_allowed: true,
            requested_at: now,
            min_start_at: now,
            started_at: None,
            completed_at: None,
            is_cancel_requested: false,
            is_canceled: false,
            is_started: false,
            is_completed: false,
            is_successful: false,
            is_resubmitted: false,
            processor_identifier: None,
            param1: None,
            param2: None,
            result_value: None,
        }
    }

    #[test]
    fn running_means_started_and_not_terminal() {
        let mut task = sample_task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(!task.is_running());

        task.is_started = true;
        assert!(task.is_running());
        assert_eq!(task.status(), TaskStatus::Running);

        task.is_canceled = true;
        assert!(!task.is_running());
        assert_eq!(task.status(), TaskStatus::Canceled);
    }

    #[test]
    fn retries_remaining_saturates() {
        let mut task = sample_task();
        assert_eq!(task.retries_remaining(), 2);
        task.retry_count = 2;
        assert_eq!(task.retries_remaining(), 0);
        task.retry_count = 5;
        assert_eq!(task.retries_remaining(), 0);
    }

    #[test]
    fn canceled_pending_task_never_completes() {
        let mut task = sample_task();
        task.mark_canceled(Utc::now());
        assert!(task.is_terminal());
        assert!(!task.is_completed);
        assert!(!task.is_succeeded());
    }

    #[test]
    fn failed_task_is_terminal_but_not_succeeded() {
        let mut task = sample_task();
        task.is_started = true;
        task.is_completed = true;
        assert!(task.is_terminal());
        assert!(!task.is_succeeded());
        assert_eq!(task.status().to_string(), "failed");
    }
}
