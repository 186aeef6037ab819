//! Built-in task handlers, planners and catalog entries.
//!
//! Enough to exercise the engine end to end without external code:
//! `echo` returns its `param1`, `fail` always errors.

use dynaflow_core::engine::handler::{HandlerRegistry, TaskContext, TaskError, TaskHandler};
use dynaflow_core::engine::planner::{FlowPlanner, PlanError, PlannerRegistry, SingleTaskPlanner, TaskPlan, TaskSpec};
use dynaflow_core::repository::FlowStore;
use dynaflow_types::catalog::{FlowType, TaskType};
use dynaflow_types::error::RepositoryError;
use dynaflow_types::flow::Flow;
use dynaflow_types::ids::{FlowTypeId, OwnerId, TaskTypeId};

pub const ECHO: &str = "echo";
pub const FAIL: &str = "fail";
pub const PIPELINE: &str = "pipeline";

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub struct EchoHandler;

impl TaskHandler for EchoHandler {
    async fn run(&self, ctx: TaskContext) -> Result<String, TaskError> {
        if ctx.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(ctx.param1.unwrap_or_default())
    }
}

pub struct FailHandler;

impl TaskHandler for FailHandler {
    async fn run(&self, ctx: TaskContext) -> Result<String, TaskError> {
        let reason = ctx.param1.unwrap_or_else(|| "fail task always errors".to_string());
        Err(TaskError::Failed(reason))
    }
}

pub fn handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(ECHO, EchoHandler);
    registry.register(FAIL, FailHandler);
    registry
}

// ---------------------------------------------------------------------------
// Planners
// ---------------------------------------------------------------------------

/// extract -> transform -> load, each echoing the flow's `param1`.
pub struct PipelinePlanner;

impl FlowPlanner for PipelinePlanner {
    async fn plan(&self, flow: &Flow) -> Result<TaskPlan, PlanError> {
        let payload = flow.param1.clone().unwrap_or_default();
        Ok(TaskPlan::new()
            .task(TaskSpec::new("extract", ECHO).description("extract").param1(payload.clone()))
            .task(
                TaskSpec::new("transform", ECHO)
                    .description("transform")
                    .depends_on("extract")
                    .param1(payload.clone()),
            )
            .task(
                TaskSpec::new("load", ECHO)
                    .description("load")
                    .depends_on("transform")
                    .param1(payload),
            ))
    }
}

pub fn planners() -> PlannerRegistry {
    let mut registry = PlannerRegistry::new();
    registry.register(ECHO, SingleTaskPlanner { task_type: ECHO.into() });
    registry.register(FAIL, SingleTaskPlanner { task_type: FAIL.into() });
    registry.register(PIPELINE, PipelinePlanner);
    registry
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

fn flow_type(pac_id: OwnerId, lookup: &str, name: &str, description: &str, priority_level: i32, display_order: i32) -> FlowType {
    FlowType {
        id: FlowTypeId(0),
        pac_id,
        name: name.to_string(),
        lookup_enum_name: lookup.to_string(),
        description: description.to_string(),
        priority_level,
        display_order,
        is_active: true,
    }
}

fn task_type(pac_id: OwnerId, lookup: &str, name: &str, description: &str, max_retry_count: u32, display_order: i32) -> TaskType {
    TaskType {
        id: TaskTypeId(0),
        pac_id,
        name: name.to_string(),
        lookup_enum_name: lookup.to_string(),
        description: description.to_string(),
        priority_level: 100,
        display_order,
        is_active: true,
        max_retry_count,
        is_parallel_run_allowed: true,
    }
}

/// Upsert the built-in flow and task types. Safe to run repeatedly.
pub async fn seed_catalog<S: FlowStore>(
    store: &S,
    pac_id: OwnerId,
) -> Result<(Vec<FlowType>, Vec<TaskType>), RepositoryError> {
    let task_types = [
        task_type(pac_id, ECHO, "Echo", "Returns param1", 0, 1),
        task_type(pac_id, FAIL, "Fail", "Always errors", 2, 2),
    ];
    let flow_types = [
        flow_type(pac_id, ECHO, "Echo", "One echo task", 100, 1),
        flow_type(pac_id, FAIL, "Fail", "One failing task", 100, 2),
        flow_type(pac_id, PIPELINE, "Pipeline", "extract, transform, load", 50, 3),
    ];

    let mut seeded_tasks = Vec::with_capacity(task_types.len());
    for t in &task_types {
        seeded_tasks.push(store.upsert_task_type(t).await?);
    }
    let mut seeded_flows = Vec::with_capacity(flow_types.len());
    for f in &flow_types {
        seeded_flows.push(store.upsert_flow_type(f).await?);
    }
    Ok((seeded_flows, seeded_tasks))
}
