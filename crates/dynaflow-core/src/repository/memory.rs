//! In-process `FlowStore` adapter.
//!
//! Keeps every record in plain maps behind one mutex, so each store call is
//! atomic exactly like a single SQL statement or transaction would be. Used by
//! engine tests and by embedders that do not need durability.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dynaflow_types::catalog::{FlowType, TaskType};
use dynaflow_types::dependency::{NewTaskDependency, TaskDependency};
use dynaflow_types::error::RepositoryError;
use dynaflow_types::flow::{Flow, NewFlow};
use dynaflow_types::ids::{
    DependencyId, FlowId, FlowTypeId, OwnerId, ScheduleId, TaskId, TaskTypeId,
};
use dynaflow_types::schedule::{FlowSchedule, NewFlowSchedule};
use dynaflow_types::task::{NewTask, Task};
use uuid::Uuid;

use super::{CandidateQuery, CandidateTask, FlowStore, VersionedUpdate};

#[derive(Default)]
struct State {
    next_id: i64,
    flows: BTreeMap<FlowId, Flow>,
    tasks: BTreeMap<TaskId, Task>,
    dependencies: BTreeMap<DependencyId, TaskDependency>,
    schedules: BTreeMap<ScheduleId, FlowSchedule>,
    flow_types: BTreeMap<FlowTypeId, FlowType>,
    task_types: BTreeMap<TaskTypeId, TaskType>,
    #[cfg(test)]
    reject_task_inserts: bool,
}

impl State {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_task_inserts(&self) -> Result<(), RepositoryError> {
        #[cfg(test)]
        if self.reject_task_inserts {
            return Err(RepositoryError::Transient("task inserts rejected".to_string()));
        }
        Ok(())
    }

    fn insert_task(&mut self, new: &NewTask) -> Result<Task, RepositoryError> {
        self.check_task_inserts()?;
        if !self.flows.contains_key(&new.flow_id) {
            return Err(RepositoryError::Conflict(format!(
                "flow {} does not exist",
                new.flow_id
            )));
        }
        let id = TaskId(self.allocate());
        let task = Task {
            id,
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            flow_id: new.flow_id,
            flow_subject_code: new.flow_subject_code,
            type_id: new.type_id,
            description: new.description.clone(),
            dependency_task_id: new.dependency_task_id,
            max_retry_count: new.max_retry_count,
            retry_count: 0,
            is_parallel_run_allowed: new.is_parallel_run_allowed,
            requested_at: new.requested_at,
            min_start_at: new.min_start_at,
            started_at: None,
            completed_at: None,
            is_cancel_requested: false,
            is_canceled: false,
            is_started: false,
            is_completed: false,
            is_successful: false,
            is_resubmitted: false,
            processor_identifier: None,
            param1: new.param1.clone(),
            param2: new.param2.clone(),
            result_value: None,
        };
        self.tasks.insert(id, task.clone());
        Ok(task)
    }

    /// Some predecessor of `task` is unresolved, missing or not yet terminal.
    fn is_waiting(&self, task: &Task) -> bool {
        let unfinished = |id: TaskId| self.tasks.get(&id).is_none_or(|p| !p.is_terminal());
        task.dependency_task_id.is_some_and(unfinished)
            || self
                .dependencies
                .values()
                .filter(|d| d.task_id == task.id)
                .any(|d| !d.is_resolved() || d.dependency_task_id.is_some_and(unfinished))
    }

    fn write_task(&mut self, task: &Task, expected: Uuid) -> Result<VersionedUpdate, RepositoryError> {
        let stored = self.tasks.get_mut(&task.id).ok_or(RepositoryError::NotFound)?;
        if stored.last_change_code != expected {
            return Ok(VersionedUpdate::Stale);
        }
        let version = Uuid::now_v7();
        stored.description = task.description.clone();
        stored.dependency_task_id = task.dependency_task_id;
        stored.max_retry_count = task.max_retry_count;
        stored.retry_count = task.retry_count;
        stored.is_parallel_run_allowed = task.is_parallel_run_allowed;
        stored.min_start_at = task.min_start_at;
        stored.started_at = task.started_at;
        stored.completed_at = task.completed_at;
        stored.is_cancel_requested = task.is_cancel_requested;
        stored.is_canceled = task.is_canceled;
        stored.is_started = task.is_started;
        stored.is_completed = task.is_completed;
        stored.is_successful = task.is_successful;
        stored.is_resubmitted = task.is_resubmitted;
        stored.processor_identifier = task.processor_identifier.clone();
        stored.param1 = task.param1.clone();
        stored.param2 = task.param2.clone();
        stored.result_value = task.result_value.clone();
        stored.last_change_code = version;
        Ok(VersionedUpdate::Applied(version))
    }
}

/// `FlowStore` backed by in-memory maps. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryFlowStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later task insert fail.
    #[cfg(test)]
    pub(crate) fn reject_task_inserts(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.reject_task_inserts = true;
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Query("store state poisoned".to_string()))
    }
}

fn by_priority(a: &Flow, b: &Flow) -> std::cmp::Ordering {
    a.priority_level
        .cmp(&b.priority_level)
        .then(a.requested_at.cmp(&b.requested_at))
        .then(a.id.cmp(&b.id))
}

impl FlowStore for InMemoryFlowStore {
    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    async fn create_flow(&self, new: &NewFlow) -> Result<Flow, RepositoryError> {
        let mut state = self.state()?;
        let id = FlowId(state.allocate());
        let flow = Flow {
            id,
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            owner_id: new.owner_id,
            type_id: new.type_id,
            description: new.description.clone(),
            priority_level: new.priority_level,
            parent_flow_id: new.parent_flow_id,
            root_flow_id: new.root_flow_id.unwrap_or(id),
            dependency_flow_id: new.dependency_flow_id,
            subject_code: new.subject_code,
            param1: new.param1.clone(),
            requested_at: new.requested_at,
            min_start_at: new.min_start_at,
            started_at: None,
            completed_at: None,
            is_paused: false,
            is_cancel_requested: false,
            is_canceled: false,
            is_started: false,
            is_completed: false,
            is_successful: false,
            is_resubmitted: false,
            is_task_creation_started: new.task_creation_processor_identifier.is_some(),
            is_tasks_created: false,
            is_build_task_debug_required: new.is_build_task_debug_required,
            is_run_task_debug_required: new.is_run_task_debug_required,
            task_creation_processor_identifier: new.task_creation_processor_identifier.clone(),
            result_value: None,
        };
        state.flows.insert(id, flow.clone());
        Ok(flow)
    }

    async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>, RepositoryError> {
        Ok(self.state()?.flows.get(&id).cloned())
    }

    async fn get_flow_by_code(&self, code: &Uuid) -> Result<Option<Flow>, RepositoryError> {
        Ok(self
            .state()?
            .flows
            .values()
            .find(|f| f.code == *code)
            .cloned())
    }

    async fn list_flows_by_owner(
        &self,
        owner_id: OwnerId,
        limit: u32,
    ) -> Result<Vec<Flow>, RepositoryError> {
        let state = self.state()?;
        let mut flows: Vec<Flow> = state
            .flows
            .values()
            .filter(|f| f.owner_id == owner_id)
            .cloned()
            .collect();
        flows.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then(b.id.cmp(&a.id)));
        flows.truncate(limit as usize);
        Ok(flows)
    }

    async fn list_dependent_flows(&self, flow_id: FlowId) -> Result<Vec<Flow>, RepositoryError> {
        Ok(self
            .state()?
            .flows
            .values()
            .filter(|f| {
                f.id != flow_id
                    && (f.parent_flow_id == Some(flow_id) || f.dependency_flow_id == Some(flow_id))
            })
            .cloned()
            .collect())
    }

    async fn list_flows_pending_task_build(
        &self,
        owner_id: Option<OwnerId>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Flow>, RepositoryError> {
        let state = self.state()?;
        let mut flows: Vec<Flow> = state
            .flows
            .values()
            .filter(|f| owner_id.is_none_or(|o| f.owner_id == o))
            .filter(|f| {
                !f.is_task_creation_started
                    && !f.is_tasks_created
                    && !f.is_paused
                    && !f.is_cancel_requested
                    && !f.is_terminal()
                    && f.min_start_at <= now
            })
            .cloned()
            .collect();
        flows.sort_by(by_priority);
        flows.truncate(limit as usize);
        Ok(flows)
    }

    async fn list_flows_pending_cancel(
        &self,
        owner_id: Option<OwnerId>,
        limit: u32,
    ) -> Result<Vec<Flow>, RepositoryError> {
        let state = self.state()?;
        let mut flows: Vec<Flow> = state
            .flows
            .values()
            .filter(|f| owner_id.is_none_or(|o| f.owner_id == o))
            .filter(|f| f.is_cancel_requested && !f.is_terminal())
            .cloned()
            .collect();
        flows.sort_by_key(|f| f.id);
        flows.truncate(limit as usize);
        Ok(flows)
    }

    async fn update_flow(&self, flow: &Flow, expected: Uuid) -> Result<VersionedUpdate, RepositoryError> {
        let mut state = self.state()?;
        let stored = state.flows.get_mut(&flow.id).ok_or(RepositoryError::NotFound)?;
        if stored.last_change_code != expected {
            return Ok(VersionedUpdate::Stale);
        }
        let version = Uuid::now_v7();
        stored.description = flow.description.clone();
        stored.priority_level = flow.priority_level;
        stored.dependency_flow_id = flow.dependency_flow_id;
        stored.param1 = flow.param1.clone();
        stored.min_start_at = flow.min_start_at;
        stored.started_at = flow.started_at;
        stored.completed_at = flow.completed_at;
        stored.is_paused = flow.is_paused;
        stored.is_cancel_requested = flow.is_cancel_requested;
        stored.is_canceled = flow.is_canceled;
        stored.is_started = flow.is_started;
        stored.is_completed = flow.is_completed;
        stored.is_successful = flow.is_successful;
        stored.is_resubmitted = flow.is_resubmitted;
        stored.is_task_creation_started = flow.is_task_creation_started;
        stored.is_tasks_created = flow.is_tasks_created;
        stored.is_build_task_debug_required = flow.is_build_task_debug_required;
        stored.is_run_task_debug_required = flow.is_run_task_debug_required;
        stored.task_creation_processor_identifier = flow.task_creation_processor_identifier.clone();
        stored.result_value = flow.result_value.clone();
        stored.last_change_code = version;
        Ok(VersionedUpdate::Applied(version))
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    async fn create_task(&self, task: &NewTask) -> Result<Task, RepositoryError> {
        self.state()?.insert_task(task)
    }

    async fn create_tasks(&self, tasks: &[NewTask]) -> Result<Vec<Task>, RepositoryError> {
        let mut state = self.state()?;
        state.check_task_inserts()?;
        if let Some(missing) = tasks.iter().find(|t| !state.flows.contains_key(&t.flow_id)) {
            return Err(RepositoryError::Conflict(format!(
                "flow {} does not exist",
                missing.flow_id
            )));
        }
        tasks.iter().map(|t| state.insert_task(t)).collect()
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, RepositoryError> {
        Ok(self.state()?.tasks.get(&id).cloned())
    }

    async fn get_task_by_code(&self, code: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self
            .state()?
            .tasks
            .values()
            .find(|t| t.code == *code)
            .cloned())
    }

    async fn list_tasks_by_flow(&self, flow_id: FlowId) -> Result<Vec<Task>, RepositoryError> {
        Ok(self
            .state()?
            .tasks
            .values()
            .filter(|t| t.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn list_candidate_tasks(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<CandidateTask>, RepositoryError> {
        let state = self.state()?;
        let mut candidates: Vec<CandidateTask> = state
            .tasks
            .values()
            .filter(|t| !t.is_started && !t.is_terminal() && !t.is_cancel_requested)
            .filter(|t| t.min_start_at <= query.now)
            .filter(|t| !state.is_waiting(t))
            .filter(|t| {
                query
                    .task_type_ids
                    .as_ref()
                    .is_none_or(|ids| ids.contains(&t.type_id))
            })
            .filter_map(|t| {
                let flow = state.flows.get(&t.flow_id)?;
                let flow_ok = query.owner_id.is_none_or(|o| flow.owner_id == o)
                    && flow.is_tasks_created
                    && !flow.is_paused
                    && !flow.is_cancel_requested
                    && !flow.is_terminal();
                flow_ok.then(|| CandidateTask {
                    task: t.clone(),
                    flow_priority_level: flow.priority_level,
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.flow_priority_level
                .cmp(&b.flow_priority_level)
                .then(a.task.requested_at.cmp(&b.task.requested_at))
                .then(a.task.id.cmp(&b.task.id))
        });
        candidates.truncate(query.limit as usize);
        Ok(candidates)
    }

    async fn update_task(&self, task: &Task, expected: Uuid) -> Result<VersionedUpdate, RepositoryError> {
        self.state()?.write_task(task, expected)
    }

    async fn claim_task(&self, task: &Task, expected: Uuid) -> Result<VersionedUpdate, RepositoryError> {
        let mut state = self.state()?;
        if !task.is_parallel_run_allowed {
            let sibling_running = state.tasks.values().any(|t| {
                t.id != task.id && t.flow_id == task.flow_id && t.type_id == task.type_id && t.is_running()
            });
            if sibling_running {
                return Ok(VersionedUpdate::Stale);
            }
        }
        state.write_task(task, expected)
    }

    // -----------------------------------------------------------------------
    // Dependency edges
    // -----------------------------------------------------------------------

    async fn create_dependency(
        &self,
        edge: &NewTaskDependency,
    ) -> Result<TaskDependency, RepositoryError> {
        let mut state = self.state()?;
        if !state.tasks.contains_key(&edge.task_id) {
            return Err(RepositoryError::Conflict(format!(
                "task {} does not exist",
                edge.task_id
            )));
        }
        let id = DependencyId(state.allocate());
        let dependency = TaskDependency {
            id,
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            task_id: edge.task_id,
            dependency_task_id: edge.dependency_task_id,
            is_placeholder: edge.is_placeholder,
        };
        state.dependencies.insert(id, dependency.clone());
        Ok(dependency)
    }

    async fn list_dependencies_for_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<TaskDependency>, RepositoryError> {
        Ok(self
            .state()?
            .dependencies
            .values()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn update_dependency(
        &self,
        edge: &TaskDependency,
        expected: Uuid,
    ) -> Result<VersionedUpdate, RepositoryError> {
        let mut state = self.state()?;
        let stored = state
            .dependencies
            .get_mut(&edge.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.last_change_code != expected {
            return Ok(VersionedUpdate::Stale);
        }
        let version = Uuid::now_v7();
        stored.dependency_task_id = edge.dependency_task_id;
        stored.is_placeholder = edge.is_placeholder;
        stored.last_change_code = version;
        Ok(VersionedUpdate::Applied(version))
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    async fn create_schedule(
        &self,
        schedule: &NewFlowSchedule,
    ) -> Result<FlowSchedule, RepositoryError> {
        let mut state = self.state()?;
        let id = ScheduleId(state.allocate());
        let record = FlowSchedule {
            id,
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            owner_id: schedule.owner_id,
            flow_type_id: schedule.flow_type_id,
            frequency_in_hours: schedule.frequency_in_hours,
            is_active: schedule.is_active,
            last_run_at: None,
            next_run_at: schedule.next_run_at,
            param1: schedule.param1.clone(),
        };
        state.schedules.insert(id, record.clone());
        Ok(record)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<FlowSchedule>, RepositoryError> {
        Ok(self.state()?.schedules.get(&id).cloned())
    }

    async fn list_schedules(
        &self,
        owner_id: Option<OwnerId>,
    ) -> Result<Vec<FlowSchedule>, RepositoryError> {
        Ok(self
            .state()?
            .schedules
            .values()
            .filter(|s| owner_id.is_none_or(|o| s.owner_id == o))
            .cloned()
            .collect())
    }

    async fn list_due_schedules(
        &self,
        owner_id: Option<OwnerId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowSchedule>, RepositoryError> {
        let state = self.state()?;
        let mut due: Vec<FlowSchedule> = state
            .schedules
            .values()
            .filter(|s| owner_id.is_none_or(|o| s.owner_id == o) && s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn update_schedule(
        &self,
        schedule: &FlowSchedule,
        expected: Uuid,
    ) -> Result<VersionedUpdate, RepositoryError> {
        let mut state = self.state()?;
        let stored = state
            .schedules
            .get_mut(&schedule.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.last_change_code != expected {
            return Ok(VersionedUpdate::Stale);
        }
        let version = Uuid::now_v7();
        stored.frequency_in_hours = schedule.frequency_in_hours;
        stored.is_active = schedule.is_active;
        stored.last_run_at = schedule.last_run_at;
        stored.next_run_at = schedule.next_run_at;
        stored.param1 = schedule.param1.clone();
        stored.last_change_code = version;
        Ok(VersionedUpdate::Applied(version))
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    async fn upsert_flow_type(&self, flow_type: &FlowType) -> Result<FlowType, RepositoryError> {
        let mut state = self.state()?;
        let existing = state
            .flow_types
            .values()
            .find(|t| t.lookup_enum_name == flow_type.lookup_enum_name)
            .map(|t| t.id);
        let id = match existing {
            Some(id) => id,
            None => FlowTypeId(state.allocate()),
        };
        let record = FlowType {
            id,
            ..flow_type.clone()
        };
        state.flow_types.insert(id, record.clone());
        Ok(record)
    }

    async fn list_flow_types(&self) -> Result<Vec<FlowType>, RepositoryError> {
        let mut types: Vec<FlowType> = self.state()?.flow_types.values().cloned().collect();
        types.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.name.cmp(&b.name)));
        Ok(types)
    }

    async fn upsert_task_type(&self, task_type: &TaskType) -> Result<TaskType, RepositoryError> {
        let mut state = self.state()?;
        let existing = state
            .task_types
            .values()
            .find(|t| t.lookup_enum_name == task_type.lookup_enum_name)
            .map(|t| t.id);
        let id = match existing {
            Some(id) => id,
            None => TaskTypeId(state.allocate()),
        };
        let record = TaskType {
            id,
            ..task_type.clone()
        };
        state.task_types.insert(id, record.clone());
        Ok(record)
    }

    async fn list_task_types(&self) -> Result<Vec<TaskType>, RepositoryError> {
        let mut types: Vec<TaskType> = self.state()?.task_types.values().cloned().collect();
        types.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.name.cmp(&b.name)));
        Ok(types)
    }
}
