//! Task planning for flows created without explicit tasks.
//!
//! A `FlowPlanner` is registered per flow type (`lookup_enum_name`) and turns
//! a flow into a [`TaskPlan`]: keyed task specs whose `depends_on` lists refer
//! to other keys in the same plan. Keys may point forward; the builder records
//! those as placeholder edges and resolves them once every task exists.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dynaflow_types::error::ValidationError;
use dynaflow_types::flow::Flow;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One task to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Plan-local key referenced by `depends_on`.
    pub key: String,
    /// Task type `lookup_enum_name`.
    pub task_type: String,
    pub description: String,
    pub depends_on: Vec<String>,
    /// Overrides the task type default.
    pub max_retry_count: Option<u32>,
    /// Overrides the task type default.
    pub is_parallel_run_allowed: Option<bool>,
    pub param1: Option<String>,
    pub param2: Option<String>,
}

impl TaskSpec {
    pub fn new(key: impl Into<String>, task_type: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            description: key.clone(),
            key,
            task_type: task_type.into(),
            depends_on: Vec::new(),
            max_retry_count: None,
            is_parallel_run_allowed: None,
            param1: None,
            param2: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = Some(count);
        self
    }

    pub fn parallel_run_allowed(mut self, allowed: bool) -> Self {
        self.is_parallel_run_allowed = Some(allowed);
        self
    }

    pub fn param1(mut self, value: impl Into<String>) -> Self {
        self.param1 = Some(value.into());
        self
    }

    pub fn param2(mut self, value: impl Into<String>) -> Self {
        self.param2 = Some(value.into());
        self
    }
}

/// Ordered list of task specs. Creation follows this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPlan {
    pub tasks: Vec<TaskSpec>,
}

impl TaskPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Structural checks: unique non-empty keys, known dependency keys, no
    /// self-dependency, no cycles. Task types are checked by the builder.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut keys = HashSet::new();
        for spec in &self.tasks {
            if spec.key.trim().is_empty() {
                return Err(ValidationError::InvalidPlan("empty task key".into()));
            }
            if !keys.insert(spec.key.as_str()) {
                return Err(ValidationError::InvalidPlan(format!(
                    "duplicate task key '{}'",
                    spec.key
                )));
            }
        }
        for spec in &self.tasks {
            for dep in &spec.depends_on {
                if dep == &spec.key {
                    return Err(ValidationError::InvalidPlan(format!(
                        "task '{}' depends on itself",
                        spec.key
                    )));
                }
                if !keys.contains(dep.as_str()) {
                    return Err(ValidationError::InvalidPlan(format!(
                        "task '{}' depends on unknown key '{dep}'",
                        spec.key
                    )));
                }
            }
        }
        self.check_acyclic()
    }

    /// Kahn's algorithm over the key graph.
    fn check_acyclic(&self) -> Result<(), ValidationError> {
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|s| (s.key.as_str(), 0))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for spec in &self.tasks {
            let mut seen = HashSet::new();
            for dep in spec.depends_on.iter().filter(|d| seen.insert(d.as_str())) {
                *in_degree.entry(spec.key.as_str()).or_default() += 1;
                dependents.entry(dep.as_str()).or_default().push(spec.key.as_str());
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited = 0;
        while let Some(key) = ready.pop() {
            visited += 1;
            for next in dependents.get(key).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*next);
                    }
                }
            }
        }

        if visited == self.tasks.len() {
            Ok(())
        } else {
            Err(ValidationError::InvalidPlan("dependency cycle".into()))
        }
    }
}

// ---------------------------------------------------------------------------
// Planner port
// ---------------------------------------------------------------------------

/// Planner failure. The flow is completed as failed with this message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct PlanError(pub String);

/// Produces the task plan for a flow.
pub trait FlowPlanner: Send + Sync {
    fn plan(&self, flow: &Flow) -> impl Future<Output = Result<TaskPlan, PlanError>> + Send;
}

/// Object-safe version of [`FlowPlanner`] with boxed futures.
pub trait FlowPlannerDyn: Send + Sync {
    fn plan_boxed<'a>(
        &'a self,
        flow: &'a Flow,
    ) -> Pin<Box<dyn Future<Output = Result<TaskPlan, PlanError>> + Send + 'a>>;
}

impl<T: FlowPlanner> FlowPlannerDyn for T {
    fn plan_boxed<'a>(
        &'a self,
        flow: &'a Flow,
    ) -> Pin<Box<dyn Future<Output = Result<TaskPlan, PlanError>> + Send + 'a>> {
        Box::pin(self.plan(flow))
    }
}

/// Type-erased planner for the registry.
pub struct BoxFlowPlanner {
    inner: Box<dyn FlowPlannerDyn + Send + Sync>,
}

impl BoxFlowPlanner {
    pub fn new<T: FlowPlanner + 'static>(planner: T) -> Self {
        Self {
            inner: Box::new(planner),
        }
    }

    pub async fn plan(&self, flow: &Flow) -> Result<TaskPlan, PlanError> {
        self.inner.plan_boxed(flow).await
    }
}

/// Planners keyed by flow type `lookup_enum_name`.
#[derive(Default)]
pub struct PlannerRegistry {
    planners: HashMap<String, Arc<BoxFlowPlanner>>,
}

impl PlannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: FlowPlanner + 'static>(&mut self, flow_type: impl Into<String>, planner: T) {
        self.planners
            .insert(flow_type.into(), Arc::new(BoxFlowPlanner::new(planner)));
    }

    pub fn get(&self, flow_type: &str) -> Option<Arc<BoxFlowPlanner>> {
        self.planners.get(flow_type).cloned()
    }

    pub fn flow_types(&self) -> impl Iterator<Item = &str> {
        self.planners.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Stock planners
// ---------------------------------------------------------------------------

/// Returns the same plan for every flow.
#[derive(Debug, Clone)]
pub struct StaticPlanner(pub TaskPlan);

impl FlowPlanner for StaticPlanner {
    async fn plan(&self, _flow: &Flow) -> Result<TaskPlan, PlanError> {
        Ok(self.0.clone())
    }
}

/// One task of a fixed type carrying the flow's `param1`.
#[derive(Debug, Clone)]
pub struct SingleTaskPlanner {
    pub task_type: String,
}

impl FlowPlanner for SingleTaskPlanner {
    async fn plan(&self, flow: &Flow) -> Result<TaskPlan, PlanError> {
        let mut spec = TaskSpec::new("main", self.task_type.clone()).description(flow.description.clone());
        spec.param1 = flow.param1.clone();
        Ok(TaskPlan::new().task(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> TaskPlan {
        TaskPlan::new()
            .task(TaskSpec::new("load", "echo").depends_on("extract"))
            .task(TaskSpec::new("extract", "echo"))
            .task(TaskSpec::new("report", "echo").depends_on("load").depends_on("extract"))
    }

    #[test]
    fn forward_references_are_valid() {
        assert!(chain().validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_and_unknown_keys() {
        let dup = TaskPlan::new()
            .task(TaskSpec::new("a", "echo"))
            .task(TaskSpec::new("a", "echo"));
        assert!(matches!(dup.validate(), Err(ValidationError::InvalidPlan(m)) if m.contains("duplicate")));

        let unknown = TaskPlan::new().task(TaskSpec::new("a", "echo").depends_on("b"));
        assert!(matches!(unknown.validate(), Err(ValidationError::InvalidPlan(m)) if m.contains("unknown key")));

        let own = TaskPlan::new().task(TaskSpec::new("a", "echo").depends_on("a"));
        assert!(own.validate().is_err());
    }

    #[test]
    fn rejects_cycles() {
        let cycle = TaskPlan::new()
            .task(TaskSpec::new("a", "echo").depends_on("c"))
            .task(TaskSpec::new("b", "echo").depends_on("a"))
            .task(TaskSpec::new("c", "echo").depends_on("b"));
        assert_eq!(
            cycle.validate(),
            Err(ValidationError::InvalidPlan("dependency cycle".into()))
        );
    }

    #[tokio::test]
    async fn registry_dispatches_by_flow_type() {
        let mut registry = PlannerRegistry::new();
        registry.register("import", StaticPlanner(chain()));
        registry.register("single", SingleTaskPlanner { task_type: "echo".into() });

        let mut flow = sample_flow();
        flow.param1 = Some("payload".into());

        let plan = registry.get("import").unwrap().plan(&flow).await.unwrap();
        assert_eq!(plan.tasks.len(), 3);

        let single = registry.get("single").unwrap().plan(&flow).await.unwrap();
        assert_eq!(single.tasks[0].param1.as_deref(), Some("payload"));
        assert!(registry.get("other").is_none());
    }

    fn sample_flow() -> Flow {
        use chrono::Utc;
        use dynaflow_types::ids::{FlowId, FlowTypeId, OwnerId};
        use uuid::Uuid;
        let now = Utc::now();
        Flow {
            id: FlowId(1),
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            owner_id: OwnerId(1),
            type_id: FlowTypeId(1),
            description: "sample".into(),
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
}
