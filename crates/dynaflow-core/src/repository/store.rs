//! Flow store trait definition.
//!
//! Covers every entity family the engine persists. All mutation of existing
//! records goes through a version-checked update: the caller passes the
//! `last_change_code` it read, the store writes only if it still matches and
//! replaces it with a fresh token.

use chrono::{DateTime, Utc};
use dynaflow_types::catalog::{FlowType, TaskType};
use dynaflow_types::dependency::{NewTaskDependency, TaskDependency};
use dynaflow_types::error::RepositoryError;
use dynaflow_types::flow::{Flow, NewFlow};
use dynaflow_types::ids::{FlowId, OwnerId, ScheduleId, TaskId};
use dynaflow_types::schedule::{FlowSchedule, NewFlowSchedule};
use dynaflow_types::task::{NewTask, Task};
use uuid::Uuid;

use super::{CandidateQuery, CandidateTask, VersionedUpdate};

/// Repository trait for engine persistence.
///
/// Covers five entity families:
/// - **Flows:** create, lookup, owner listings, version-checked update.
/// - **Tasks:** create (single and bulk), lookup, candidate query, update, claim.
/// - **Dependency edges:** create, list per task, update (placeholder resolution).
/// - **Schedules:** create, lookup, due listing, update.
/// - **Catalog:** flow and task type upsert and listing.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait FlowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Insert a flow. When `root_flow_id` is `None` the new flow becomes its
    /// own root within the same write.
    fn create_flow(
        &self,
        flow: &NewFlow,
    ) -> impl std::future::Future<Output = Result<Flow, RepositoryError>> + Send;

    fn get_flow(
        &self,
        id: FlowId,
    ) -> impl std::future::Future<Output = Result<Option<Flow>, RepositoryError>> + Send;

    fn get_flow_by_code(
        &self,
        code: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Flow>, RepositoryError>> + Send;

    /// Flows of an owner, most recently requested first.
    fn list_flows_by_owner(
        &self,
        owner_id: OwnerId,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Flow>, RepositoryError>> + Send;

    /// Flows whose `parent_flow_id` or `dependency_flow_id` is `flow_id`.
    fn list_dependent_flows(
        &self,
        flow_id: FlowId,
    ) -> impl std::future::Future<Output = Result<Vec<Flow>, RepositoryError>> + Send;

    /// Flows whose task creation has not been claimed yet and is due, ordered
    /// by priority then request time. Paused, cancel-requested and terminal
    /// flows are excluded.
    fn list_flows_pending_task_build(
        &self,
        owner_id: Option<OwnerId>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Flow>, RepositoryError>> + Send;

    /// Flows with `is_cancel_requested` set that have not finished, in id order.
    fn list_flows_pending_cancel(
        &self,
        owner_id: Option<OwnerId>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Flow>, RepositoryError>> + Send;

    /// Write the mutable fields of `flow` if the stored version is `expected`.
    fn update_flow(
        &self,
        flow: &Flow,
        expected: Uuid,
    ) -> impl std::future::Future<Output = Result<VersionedUpdate, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    fn create_task(
        &self,
        task: &NewTask,
    ) -> impl std::future::Future<Output = Result<Task, RepositoryError>> + Send;

    /// Insert several tasks atomically, returned in input order.
    fn create_tasks(
        &self,
        tasks: &[NewTask],
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    fn get_task(
        &self,
        id: TaskId,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    fn get_task_by_code(
        &self,
        code: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// All tasks of a flow, in id order.
    fn list_tasks_by_flow(
        &self,
        flow_id: FlowId,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Claimable-looking tasks ordered by flow priority ASC, request time ASC, id ASC.
    ///
    /// Tasks with a placeholder edge, or with a predecessor that is missing or
    /// not yet terminal, are left out before `limit` applies.
    fn list_candidate_tasks(
        &self,
        query: &CandidateQuery,
    ) -> impl std::future::Future<Output = Result<Vec<CandidateTask>, RepositoryError>> + Send;

    /// Write the mutable fields of `task` if the stored version is `expected`.
    fn update_task(
        &self,
        task: &Task,
        expected: Uuid,
    ) -> impl std::future::Future<Output = Result<VersionedUpdate, RepositoryError>> + Send;

    /// Version-checked update used to lease a task.
    ///
    /// Behaves like `update_task`, and additionally returns `Stale` when the
    /// task disallows parallel runs and another task of the same type in the
    /// same flow is started and not terminal. Check and write are atomic.
    fn claim_task(
        &self,
        task: &Task,
        expected: Uuid,
    ) -> impl std::future::Future<Output = Result<VersionedUpdate, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Dependency edges
    // -----------------------------------------------------------------------

    fn create_dependency(
        &self,
        edge: &NewTaskDependency,
    ) -> impl std::future::Future<Output = Result<TaskDependency, RepositoryError>> + Send;

    /// Edges whose dependent is `task_id`.
    fn list_dependencies_for_task(
        &self,
        task_id: TaskId,
    ) -> impl std::future::Future<Output = Result<Vec<TaskDependency>, RepositoryError>> + Send;

    fn update_dependency(
        &self,
        edge: &TaskDependency,
        expected: Uuid,
    ) -> impl std::future::Future<Output = Result<VersionedUpdate, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    fn create_schedule(
        &self,
        schedule: &NewFlowSchedule,
    ) -> impl std::future::Future<Output = Result<FlowSchedule, RepositoryError>> + Send;

    fn get_schedule(
        &self,
        id: ScheduleId,
    ) -> impl std::future::Future<Output = Result<Option<FlowSchedule>, RepositoryError>> + Send;

    fn list_schedules(
        &self,
        owner_id: Option<OwnerId>,
    ) -> impl std::future::Future<Output = Result<Vec<FlowSchedule>, RepositoryError>> + Send;

    /// Active schedules with `next_run_at <= now`, oldest first.
    fn list_due_schedules(
        &self,
        owner_id: Option<OwnerId>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<FlowSchedule>, RepositoryError>> + Send;

    fn update_schedule(
        &self,
        schedule: &FlowSchedule,
        expected: Uuid,
    ) -> impl std::future::Future<Output = Result<VersionedUpdate, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    /// Insert or update a flow type keyed by `lookup_enum_name`. The incoming
    /// `id` is ignored; the stored row is returned.
    fn upsert_flow_type(
        &self,
        flow_type: &FlowType,
    ) -> impl std::future::Future<Output = Result<FlowType, RepositoryError>> + Send;

    /// Flow types ordered by `display_order`, then name.
    fn list_flow_types(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<FlowType>, RepositoryError>> + Send;

    /// Insert or update a task type keyed by `lookup_enum_name`.
    fn upsert_task_type(
        &self,
        task_type: &TaskType,
    ) -> impl std::future::Future<Output = Result<TaskType, RepositoryError>> + Send;

    fn list_task_types(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<TaskType>, RepositoryError>> + Send;
}
