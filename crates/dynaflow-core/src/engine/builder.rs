//! Flow and task creation.
//!
//! `FlowBuilder` validates requests against the catalog and the store before
//! persisting anything, computes root linkage, and materialises task plans
//! including their dependency edges. Tasks of a flow become claimable only once
//! the flow is marked `is_tasks_created`, so a plan is never observed half-built.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dynaflow_types::catalog::TaskType;
use dynaflow_types::dependency::{NewTaskDependency, TaskDependency};
use dynaflow_types::error::{RepositoryError, ValidationError};
use dynaflow_types::event::EngineEvent;
use dynaflow_types::flow::{Flow, NewFlow};
use dynaflow_types::ids::{FlowId, OwnerId, TaskId};
use dynaflow_types::task::{NewTask, Task};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::EngineError;
use super::catalog::CatalogCache;
use super::completion::refresh_flow;
use super::planner::{TaskPlan, TaskSpec};
use super::versioned::{Mutation, update_flow_with};
use crate::event::EventBus;
use crate::repository::{FlowStore, VersionedUpdate};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRequest {
    pub owner_id: OwnerId,
    /// Flow type `lookup_enum_name`.
    pub flow_type: String,
    pub description: Option<String>,
    pub subject_code: Option<Uuid>,
    pub parent_flow_id: Option<FlowId>,
    pub dependency_flow_id: Option<FlowId>,
    pub param1: Option<String>,
    /// Overrides the flow type priority.
    pub priority_level: Option<i32>,
    pub min_start_at: Option<DateTime<Utc>>,
    pub is_build_task_debug_required: bool,
    pub is_run_task_debug_required: bool,
}

impl FlowRequest {
    pub fn new(owner_id: OwnerId, flow_type: impl Into<String>) -> Self {
        Self {
            owner_id,
            flow_type: flow_type.into(),
            description: None,
            subject_code: None,
            parent_flow_id: None,
            dependency_flow_id: None,
            param1: None,
            priority_level: None,
            min_start_at: None,
            is_build_task_debug_required: false,
            is_run_task_debug_required: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn subject(mut self, code: Uuid) -> Self {
        self.subject_code = Some(code);
        self
    }

    pub fn parent(mut self, flow_id: FlowId) -> Self {
        self.parent_flow_id = Some(flow_id);
        self
    }

    pub fn after_flow(mut self, flow_id: FlowId) -> Self {
        self.dependency_flow_id = Some(flow_id);
        self
    }

    pub fn param1(mut self, value: impl Into<String>) -> Self {
        self.param1 = Some(value.into());
        self
    }

    pub fn priority(mut self, level: i32) -> Self {
        self.priority_level = Some(level);
        self
    }

    pub fn start_after(mut self, at: DateTime<Utc>) -> Self {
        self.min_start_at = Some(at);
        self
    }

    pub fn debug_build(mut self, required: bool) -> Self {
        self.is_build_task_debug_required = required;
        self
    }

    pub fn debug_run(mut self, required: bool) -> Self {
        self.is_run_task_debug_required = required;
        self
    }
}

/// Request to add one task to a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    /// Task type `lookup_enum_name`.
    pub task_type: String,
    pub description: String,
    pub dependency_task_id: Option<TaskId>,
    pub max_retry_count: Option<u32>,
    pub is_parallel_run_allowed: Option<bool>,
    pub param1: Option<String>,
    pub param2: Option<String>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        Self {
            description: task_type.clone(),
            task_type,
            dependency_task_id: None,
            max_retry_count: None,
            is_parallel_run_allowed: None,
            param1: None,
            param2: None,
        }
    }
}

// ---------------------------------------------------------------------------
// FlowBuilder
// ---------------------------------------------------------------------------

/// Creates flows, tasks and dependency edges.
pub struct FlowBuilder<S> {
    store: Arc<S>,
    catalog: Arc<CatalogCache>,
    events: EventBus,
    conflict_retry_limit: u32,
}

impl<S: FlowStore> FlowBuilder<S> {
    pub fn new(store: Arc<S>, catalog: Arc<CatalogCache>, conflict_retry_limit: u32) -> Self {
        Self {
            store,
            catalog,
            events: EventBus::default(),
            conflict_retry_limit,
        }
    }

    /// Publish completions of submitted flows on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Create a flow whose tasks will be planned by a processor.
    pub async fn create_flow(&self, request: &FlowRequest) -> Result<Flow, EngineError> {
        let new = self.prepare_flow(request, None).await?;
        let flow = self.store.create_flow(&new).await?;
        info!(
            flow_id = %flow.id,
            owner_id = %flow.owner_id,
            flow_type = %request.flow_type,
            root_flow_id = %flow.root_flow_id,
            "flow created"
        );
        Ok(flow)
    }

    /// Create a flow together with its tasks. The plan is checked before the
    /// flow is written; processors never run a planner for this flow.
    ///
    /// When task creation fails after the flow was written, the flow is
    /// completed as failed before the error is returned. An empty plan
    /// completes the flow right away.
    pub async fn submit_flow(
        &self,
        request: &FlowRequest,
        plan: &TaskPlan,
        submitter: &str,
    ) -> Result<(Flow, Vec<Task>), EngineError> {
        self.check_plan(plan)?;
        let new = self.prepare_flow(request, Some(submitter.to_string())).await?;
        let flow = self.store.create_flow(&new).await?;
        info!(flow_id = %flow.id, owner_id = %flow.owner_id, tasks = plan.tasks.len(), "flow submitted");

        let tasks = match self.materialize_and_close(&flow, plan).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "task creation failed");
                match self.fail_task_creation(flow.id, &e.to_string()).await {
                    Ok(_) => self.events.publish(EngineEvent::FlowCompleted {
                        flow_id: flow.id,
                        is_successful: false,
                    }),
                    Err(close) => warn!(flow_id = %flow.id, error = %close, "could not fail flow"),
                }
                return Err(e);
            }
        };
        refresh_flow(self.store.as_ref(), &self.events, flow.id, self.conflict_retry_limit).await?;
        let flow = self.fresh_flow(flow.id).await?;
        Ok((flow, tasks))
    }

    async fn materialize_and_close(&self, flow: &Flow, plan: &TaskPlan) -> Result<Vec<Task>, EngineError> {
        let tasks = self.materialize_plan(flow, plan).await?;
        self.mark_tasks_created(flow.id).await?;
        Ok(tasks)
    }

    /// Add one task to a flow that is still being built.
    pub async fn build_task(&self, flow: &Flow, request: &TaskRequest) -> Result<Task, EngineError> {
        let current = self.fresh_flow(flow.id).await?;
        if current.is_tasks_created {
            return Err(EngineError::TasksAlreadyCreated(current.id));
        }
        let task_type = self.active_task_type(&request.task_type)?;
        if let Some(dep_id) = request.dependency_task_id {
            self.check_same_flow(dep_id, current.id).await?;
        }
        let new = self.new_task(&current, &task_type, request, Utc::now());
        let task = self.store.create_task(&new).await?;
        debug!(task_id = %task.id, flow_id = %task.flow_id, task_type = %request.task_type, "task created");
        Ok(task)
    }

    /// Record that `task` must wait for `dependency_task_id`.
    ///
    /// An edge without a target is always stored as a placeholder.
    pub async fn build_dependency_edge(
        &self,
        task: &Task,
        dependency_task_id: Option<TaskId>,
        is_placeholder: bool,
    ) -> Result<TaskDependency, EngineError> {
        if let Some(dep_id) = dependency_task_id {
            if dep_id == task.id {
                return Err(ValidationError::InvalidPlan(format!("task {} depends on itself", task.id)).into());
            }
            if !is_placeholder {
                self.check_same_flow(dep_id, task.flow_id).await?;
            }
        }
        let edge = NewTaskDependency {
            task_id: task.id,
            dependency_task_id,
            is_placeholder: is_placeholder || dependency_task_id.is_none(),
        };
        Ok(self.store.create_dependency(&edge).await?)
    }

    /// Point a placeholder edge at its now-existing predecessor.
    pub async fn resolve_placeholder(
        &self,
        edge: &TaskDependency,
        dependency_task_id: TaskId,
    ) -> Result<TaskDependency, EngineError> {
        let dependent = self
            .store
            .get_task(edge.task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(edge.task_id))?;
        self.check_same_flow(dependency_task_id, dependent.flow_id).await?;

        let mut current = edge.clone();
        for _ in 0..self.conflict_retry_limit.max(1) {
            if current.is_resolved() {
                return Ok(current);
            }
            let mut resolved = current.clone();
            resolved.dependency_task_id = Some(dependency_task_id);
            resolved.is_placeholder = false;
            match self.store.update_dependency(&resolved, current.last_change_code).await? {
                VersionedUpdate::Applied(version) => {
                    resolved.last_change_code = version;
                    return Ok(resolved);
                }
                VersionedUpdate::Stale => {
                    current = self
                        .store
                        .list_dependencies_for_task(edge.task_id)
                        .await?
                        .into_iter()
                        .find(|d| d.id == edge.id)
                        .ok_or(RepositoryError::NotFound)?;
                }
            }
        }
        Err(EngineError::ConflictRetriesExhausted {
            entity: format!("dependency {}", edge.id),
            attempts: self.conflict_retry_limit.max(1),
        })
    }

    /// Create every task of `plan` under `flow`, in plan order.
    ///
    /// The first already-created predecessor of a task becomes its
    /// `dependency_task_id`; other predecessors become edges. Forward references
    /// are stored as placeholders and resolved once all tasks exist. Runs of
    /// tasks that do not depend on each other are inserted with one bulk write.
    pub async fn materialize_plan(&self, flow: &Flow, plan: &TaskPlan) -> Result<Vec<Task>, EngineError> {
        let types = self.check_plan(plan)?;
        let current = self.fresh_flow(flow.id).await?;
        if current.is_tasks_created {
            return Err(EngineError::TasksAlreadyCreated(current.id));
        }

        let now = Utc::now();
        let mut created: HashMap<&str, TaskId> = HashMap::new();
        let mut tasks = Vec::with_capacity(plan.tasks.len());
        let mut placeholders: Vec<(TaskDependency, &str)> = Vec::new();

        for run in independent_runs(plan) {
            let mut batch = Vec::with_capacity(run.len());
            let mut links = Vec::with_capacity(run.len());
            for (spec, task_type) in plan.tasks[run.clone()].iter().zip(&types[run.clone()]) {
                let deps = distinct_dependencies(spec);
                let declared = deps.iter().find_map(|k| created.get(k).copied());
                let request = TaskRequest {
                    task_type: spec.task_type.clone(),
                    description: spec.description.clone(),
                    dependency_task_id: declared,
                    max_retry_count: spec.max_retry_count,
                    is_parallel_run_allowed: spec.is_parallel_run_allowed,
                    param1: spec.param1.clone(),
                    param2: spec.param2.clone(),
                };
                batch.push(self.new_task(&current, task_type, &request, now));
                links.push((spec.key.as_str(), deps, declared));
            }

            let stored = self.store.create_tasks(&batch).await?;
            for (task, (key, deps, declared)) in stored.into_iter().zip(links) {
                for dep in deps {
                    match created.get(dep).copied() {
                        Some(id) if Some(id) == declared => {}
                        Some(id) => {
                            self.build_dependency_edge(&task, Some(id), false).await?;
                        }
                        None => {
                            let edge = self.build_dependency_edge(&task, None, true).await?;
                            placeholders.push((edge, dep));
                        }
                    }
                }
                created.insert(key, task.id);
                tasks.push(task);
            }
        }

        for (edge, key) in placeholders {
            let target = created
                .get(key)
                .copied()
                .ok_or_else(|| ValidationError::InvalidPlan(format!("unknown key '{key}'")))?;
            self.resolve_placeholder(&edge, target).await?;
        }

        debug!(flow_id = %current.id, tasks = tasks.len(), "plan materialised");
        Ok(tasks)
    }

    /// Close task creation. Tasks become claimable from here on.
    pub async fn mark_tasks_created(&self, flow_id: FlowId) -> Result<Flow, EngineError> {
        let result = update_flow_with(self.store.as_ref(), flow_id, self.conflict_retry_limit, |f| {
            if f.is_tasks_created {
                return Err(EngineError::TasksAlreadyCreated(f.id));
            }
            f.is_task_creation_started = true;
            f.is_tasks_created = true;
            Ok(true)
        })
        .await?;
        Ok(result.into_inner())
    }

    /// Try to take the task-creation step of `flow` for `processor`.
    ///
    /// Single attempt: a version conflict means another processor got there
    /// first (or the flow changed) and yields `None`.
    pub async fn claim_task_creation(&self, flow: &Flow, processor: &str) -> Result<Option<Flow>, EngineError> {
        if flow.is_task_creation_started || flow.is_tasks_created || flow.is_terminal() {
            return Ok(None);
        }
        let mut claimed = flow.clone();
        claimed.is_task_creation_started = true;
        claimed.task_creation_processor_identifier = Some(processor.to_string());
        match self.store.update_flow(&claimed, flow.last_change_code).await? {
            VersionedUpdate::Applied(version) => {
                claimed.last_change_code = version;
                Ok(Some(claimed))
            }
            VersionedUpdate::Stale => {
                debug!(flow_id = %flow.id, processor, "task creation claimed elsewhere");
                Ok(None)
            }
        }
    }

    /// Complete a flow as failed because its tasks could not be planned.
    pub async fn fail_task_creation(&self, flow_id: FlowId, error: &str) -> Result<Flow, EngineError> {
        let now = Utc::now();
        let result = update_flow_with(self.store.as_ref(), flow_id, self.conflict_retry_limit, |f| {
            if f.is_terminal() {
                return Ok(false);
            }
            f.is_started = true;
            f.started_at = f.started_at.or(Some(now));
            f.is_completed = true;
            f.is_successful = false;
            f.completed_at = Some(now);
            f.result_value = Some(error.to_string());
            Ok(true)
        })
        .await?;
        Ok(result.into_inner())
    }

    /// Create a fresh copy of a finished flow and flag the original.
    pub async fn resubmit_flow(&self, flow_id: FlowId) -> Result<Flow, EngineError> {
        let original = self.fresh_flow(flow_id).await?;
        if !original.is_terminal() {
            return Err(ValidationError::FlowNotTerminal(flow_id.get()).into());
        }
        let flow_type = self
            .catalog
            .flow_type_by_id(original.type_id)
            .ok_or_else(|| ValidationError::UnknownFlowType(original.type_id.to_string()))?;

        let request = FlowRequest {
            owner_id: original.owner_id,
            flow_type: flow_type.lookup_enum_name,
            description: Some(original.description.clone()),
            subject_code: original.subject_code,
            parent_flow_id: original.parent_flow_id,
            dependency_flow_id: original.dependency_flow_id,
            param1: original.param1.clone(),
            priority_level: Some(original.priority_level),
            min_start_at: None,
            is_build_task_debug_required: original.is_build_task_debug_required,
            is_run_task_debug_required: original.is_run_task_debug_required,
        };
        let fresh = self.create_flow(&request).await?;

        let marked = update_flow_with(self.store.as_ref(), flow_id, self.conflict_retry_limit, |f| {
            if f.is_resubmitted {
                return Ok(false);
            }
            f.is_resubmitted = true;
            Ok(true)
        })
        .await?;
        if let Mutation::Applied(_) = marked {
            info!(flow_id = %flow_id, resubmitted_as = %fresh.id, "flow resubmitted");
        }
        Ok(fresh)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn prepare_flow(&self, request: &FlowRequest, creator: Option<String>) -> Result<NewFlow, EngineError> {
        if request.owner_id.get() <= 0 {
            return Err(ValidationError::InvalidOwner.into());
        }
        let flow_type = self
            .catalog
            .flow_type(&request.flow_type)
            .ok_or_else(|| ValidationError::UnknownFlowType(request.flow_type.clone()))?;
        if !flow_type.is_active {
            return Err(ValidationError::InactiveType(request.flow_type.clone()).into());
        }

        let mut root_flow_id = None;
        if let Some(parent_id) = request.parent_flow_id {
            let parent = self.owned_flow(parent_id, request.owner_id).await?;
            root_flow_id = Some(parent.root_flow_id);
        }
        if let Some(dep_id) = request.dependency_flow_id {
            self.owned_flow(dep_id, request.owner_id).await?;
        }

        let now = Utc::now();
        Ok(NewFlow {
            owner_id: request.owner_id,
            type_id: flow_type.id,
            description: request
                .description
                .clone()
                .unwrap_or_else(|| flow_type.name.clone()),
            priority_level: request.priority_level.unwrap_or(flow_type.priority_level),
            parent_flow_id: request.parent_flow_id,
            root_flow_id,
            dependency_flow_id: request.dependency_flow_id,
            subject_code: request.subject_code,
            param1: request.param1.clone(),
            requested_at: now,
            min_start_at: request.min_start_at.unwrap_or(now),
            is_build_task_debug_required: request.is_build_task_debug_required,
            is_run_task_debug_required: request.is_run_task_debug_required,
            task_creation_processor_identifier: creator,
        })
    }

    fn new_task(&self, flow: &Flow, task_type: &TaskType, request: &TaskRequest, now: DateTime<Utc>) -> NewTask {
        NewTask {
            flow_id: flow.id,
            flow_subject_code: flow.subject_code,
            type_id: task_type.id,
            description: request.description.clone(),
            dependency_task_id: request.dependency_task_id,
            max_retry_count: request.max_retry_count.unwrap_or(task_type.max_retry_count),
            is_parallel_run_allowed: request
                .is_parallel_run_allowed
                .unwrap_or(task_type.is_parallel_run_allowed),
            requested_at: now,
            min_start_at: flow.min_start_at.max(now),
            param1: request.param1.clone(),
            param2: request.param2.clone(),
        }
    }

    /// Validate plan structure and resolve each spec's task type.
    fn check_plan(&self, plan: &TaskPlan) -> Result<Vec<TaskType>, EngineError> {
        plan.validate()?;
        plan.tasks
            .iter()
            .map(|spec| self.active_task_type(&spec.task_type))
            .collect()
    }

    fn active_task_type(&self, name: &str) -> Result<TaskType, EngineError> {
        let task_type = self
            .catalog
            .task_type(name)
            .ok_or_else(|| ValidationError::UnknownTaskType(name.to_string()))?;
        if !task_type.is_active {
            return Err(ValidationError::InactiveType(name.to_string()).into());
        }
        Ok(task_type)
    }

    async fn fresh_flow(&self, id: FlowId) -> Result<Flow, EngineError> {
        self.store.get_flow(id).await?.ok_or(EngineError::FlowNotFound(id))
    }

    async fn owned_flow(&self, id: FlowId, owner_id: OwnerId) -> Result<Flow, EngineError> {
        let flow = self
            .store
            .get_flow(id)
            .await?
            .ok_or(ValidationError::MissingFlow(id.get()))?;
        if flow.owner_id != owner_id {
            return Err(ValidationError::OwnerMismatch {
                flow: id.get(),
                expected: owner_id.get(),
                actual: flow.owner_id.get(),
            }
            .into());
        }
        Ok(flow)
    }

    async fn check_same_flow(&self, task_id: TaskId, flow_id: FlowId) -> Result<(), EngineError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(ValidationError::MissingTask(task_id.get()))?;
        if task.flow_id != flow_id {
            return Err(ValidationError::ForeignTask {
                task: task_id.get(),
                expected: flow_id.get(),
                actual: task.flow_id.get(),
            }
            .into());
        }
        Ok(())
    }
}

fn distinct_dependencies(spec: &TaskSpec) -> Vec<&str> {
    let mut deps: Vec<&str> = Vec::with_capacity(spec.depends_on.len());
    for key in &spec.depends_on {
        if !deps.contains(&key.as_str()) {
            deps.push(key.as_str());
        }
    }
    deps
}

/// Consecutive plan positions in which no task depends on an earlier task of
/// the same run.
fn independent_runs(plan: &TaskPlan) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut keys: HashSet<&str> = HashSet::new();
    for (i, spec) in plan.tasks.iter().enumerate() {
        if spec.depends_on.iter().any(|k| keys.contains(k.as_str())) {
            runs.push(start..i);
            start = i;
            keys.clear();
        }
        keys.insert(spec.key.as_str());
    }
    if start < plan.tasks.len() {
        runs.push(start..plan.tasks.len());
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{OWNER, seeded};
    use crate::repository::memory::InMemoryFlowStore;

    async fn builder() -> (Arc<InMemoryFlowStore>, FlowBuilder<InMemoryFlowStore>) {
        let (store, catalog) = seeded().await;
        (store.clone(), FlowBuilder::new(store, catalog, 5))
    }

    #[tokio::test]
    async fn root_flow_points_at_itself_and_children_inherit_root() {
        let (store, builder) = builder().await;
        let root = builder.create_flow(&FlowRequest::new(OWNER, "import")).await.unwrap();
        assert_eq!(root.root_flow_id, root.id);
        assert_eq!(root.priority_level, 5);
        assert!(!root.is_task_creation_started);

        let child = builder
            .create_flow(&FlowRequest::new(OWNER, "import").parent(root.id))
            .await
            .unwrap();
        let grandchild = builder
            .create_flow(&FlowRequest::new(OWNER, "urgent").parent(child.id))
            .await
            .unwrap();

        assert_eq!(child.root_flow_id, root.id);
        assert_eq!(grandchild.root_flow_id, root.id);
        assert_eq!(grandchild.parent_flow_id, Some(child.id));
        assert_eq!(grandchild.priority_level, 1);

        let stored = store.get_flow(grandchild.id).await.unwrap().unwrap();
        assert_eq!(stored.root_flow_id, root.id);
    }

    #[tokio::test]
    async fn rejects_invalid_requests_before_persisting() {
        let (store, builder) = builder().await;

        let err = builder.create_flow(&FlowRequest::new(OWNER, "nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::UnknownFlowType(_))));

        let err = builder.create_flow(&FlowRequest::new(OwnerId(0), "import")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::InvalidOwner)));

        let err = builder
            .create_flow(&FlowRequest::new(OWNER, "import").parent(FlowId(77)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::MissingFlow(77))));

        let other = builder.create_flow(&FlowRequest::new(OwnerId(2), "import")).await.unwrap();
        let err = builder
            .create_flow(&FlowRequest::new(OWNER, "import").after_flow(other.id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::OwnerMismatch { .. })));

        assert_eq!(store.list_flows_by_owner(OWNER, 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn build_task_copies_subject_and_applies_type_defaults() {
        let (_store, builder) = builder().await;
        let subject = Uuid::now_v7();
        let flow = builder
            .create_flow(&FlowRequest::new(OWNER, "import").subject(subject))
            .await
            .unwrap();

        let task = builder.build_task(&flow, &TaskRequest::new("flaky")).await.unwrap();
        assert_eq!(task.flow_subject_code, Some(subject));
        assert_eq!(task.max_retry_count, 2);
        assert_eq!(task.retry_count, 0);
        assert!(task.is_parallel_run_allowed);

        let mut req = TaskRequest::new("exclusive");
        req.max_retry_count = Some(4);
        req.dependency_task_id = Some(task.id);
        let second = builder.build_task(&flow, &req).await.unwrap();
        assert_eq!(second.max_retry_count, 4);
        assert!(!second.is_parallel_run_allowed);
        assert_eq!(second.dependency_task_id, Some(task.id));
    }

    #[tokio::test]
    async fn build_after_tasks_created_is_rejected() {
        let (_store, builder) = builder().await;
        let flow = builder.create_flow(&FlowRequest::new(OWNER, "import")).await.unwrap();
        builder.build_task(&flow, &TaskRequest::new("echo")).await.unwrap();
        builder.mark_tasks_created(flow.id).await.unwrap();

        let err = builder.build_task(&flow, &TaskRequest::new("echo")).await.unwrap_err();
        assert!(matches!(err, EngineError::TasksAlreadyCreated(id) if id == flow.id));

        let err = builder.mark_tasks_created(flow.id).await.unwrap_err();
        assert!(matches!(err, EngineError::TasksAlreadyCreated(_)));
    }

    #[tokio::test]
    async fn dependency_on_task_of_another_flow_is_rejected() {
        let (_store, builder) = builder().await;
        let a = builder.create_flow(&FlowRequest::new(OWNER, "import")).await.unwrap();
        let b = builder.create_flow(&FlowRequest::new(OWNER, "import")).await.unwrap();
        let foreign = builder.build_task(&a, &TaskRequest::new("echo")).await.unwrap();

        let mut req = TaskRequest::new("echo");
        req.dependency_task_id = Some(foreign.id);
        let err = builder.build_task(&b, &req).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::ForeignTask { .. })));
    }

    #[tokio::test]
    async fn submit_resolves_forward_references() {
        let (store, builder) = builder().await;
        let plan = TaskPlan::new()
            .task(TaskSpec::new("load", "echo").depends_on("extract"))
            .task(TaskSpec::new("extract", "echo"))
            .task(TaskSpec::new("report", "echo").depends_on("extract").depends_on("load"));

        let (flow, tasks) = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &plan, "api")
            .await
            .unwrap();
        assert!(flow.is_tasks_created);
        assert!(flow.is_task_creation_started);
        assert_eq!(flow.task_creation_processor_identifier.as_deref(), Some("api"));

        let (load, extract, report) = (&tasks[0], &tasks[1], &tasks[2]);
        assert_eq!(load.dependency_task_id, None);
        let load_edges = store.list_dependencies_for_task(load.id).await.unwrap();
        assert_eq!(load_edges.len(), 1);
        assert!(load_edges[0].is_resolved());
        assert_eq!(load_edges[0].dependency_task_id, Some(extract.id));

        assert_eq!(report.dependency_task_id, Some(extract.id));
        let report_edges = store.list_dependencies_for_task(report.id).await.unwrap();
        assert_eq!(report_edges.len(), 1);
        assert_eq!(report_edges[0].dependency_task_id, Some(load.id));
    }

    #[tokio::test]
    async fn submit_with_unknown_task_type_writes_nothing() {
        let (store, builder) = builder().await;
        let plan = TaskPlan::new().task(TaskSpec::new("a", "missing"));
        let err = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &plan, "api")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::UnknownTaskType(_))));
        assert!(store.list_flows_by_owner(OWNER, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn task_creation_claim_is_exclusive() {
        let (_store, builder) = builder().await;
        let flow = builder.create_flow(&FlowRequest::new(OWNER, "import")).await.unwrap();

        let first = builder.claim_task_creation(&flow, "p1").await.unwrap();
        let second = builder.claim_task_creation(&flow, "p2").await.unwrap();
        assert_eq!(
            first.unwrap().task_creation_processor_identifier.as_deref(),
            Some("p1")
        );
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn resubmit_requires_terminal_flow() {
        let (store, builder) = builder().await;
        let flow = builder
            .create_flow(&FlowRequest::new(OWNER, "import").param1("x"))
            .await
            .unwrap();
        let err = builder.resubmit_flow(flow.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::FlowNotTerminal(_))));

        builder.fail_task_creation(flow.id, "boom").await.unwrap();
        let fresh = builder.resubmit_flow(flow.id).await.unwrap();
        assert_ne!(fresh.id, flow.id);
        assert_eq!(fresh.param1.as_deref(), Some("x"));
        assert_eq!(fresh.type_id, flow.type_id);
        assert!(!fresh.is_terminal());

        let original = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(original.is_resubmitted);
        assert!(original.is_completed && original.is_started && !original.is_successful);
        assert_eq!(original.result_value.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn placeholder_edge_without_target() {
        let (_store, builder) = builder().await;
        let flow = builder.create_flow(&FlowRequest::new(OWNER, "import")).await.unwrap();
        let task = builder.build_task(&flow, &TaskRequest::new("echo")).await.unwrap();
        let edge = builder.build_dependency_edge(&task, None, false).await.unwrap();
        assert!(edge.is_placeholder);

        let target = builder.build_task(&flow, &TaskRequest::new("echo")).await.unwrap();
        let resolved = builder.resolve_placeholder(&edge, target.id).await.unwrap();
        assert!(resolved.is_resolved());
        assert_eq!(resolved.dependency_task_id, Some(target.id));
    }

    #[tokio::test]
    async fn empty_plan_completes_on_submit() {
        let (store, builder) = builder().await;
        let (flow, tasks) = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &TaskPlan::new(), "api")
            .await
            .unwrap();
        assert!(tasks.is_empty());
        assert!(flow.is_completed && flow.is_successful);

        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(stored.is_terminal());
    }

    #[tokio::test]
    async fn failed_task_creation_fails_the_submitted_flow() {
        let (store, builder) = builder().await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let builder = builder.with_events(events);
        store.reject_task_inserts();

        let plan = TaskPlan::new().task(TaskSpec::new("a", "echo"));
        let err = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &plan, "api")
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let flows = store.list_flows_by_owner(OWNER, 10).await.unwrap();
        assert_eq!(flows.len(), 1);
        assert!(flows[0].is_completed && !flows[0].is_successful);
        assert!(flows[0].result_value.is_some());
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::FlowCompleted { is_successful: false, .. }
        ));
    }

    #[test]
    fn runs_break_where_a_task_needs_an_earlier_one() {
        let plan = TaskPlan::new()
            .task(TaskSpec::new("load", "echo").depends_on("extract"))
            .task(TaskSpec::new("extract", "echo"))
            .task(TaskSpec::new("audit", "echo"))
            .task(TaskSpec::new("report", "echo").depends_on("load"))
            .task(TaskSpec::new("mail", "echo").depends_on("extract"));
        assert_eq!(independent_runs(&plan), vec![0..3, 3..5]);
        assert!(independent_runs(&TaskPlan::new()).is_empty());
    }
}
