//! SQLite `FlowStore` implementation.
//!
//! Implements `FlowStore` from `dynaflow-core` using sqlx with split read/write
//! pools. Every update of an existing record is a single
//! `UPDATE ... WHERE id = ? AND last_change_code = ?`; when no row matches, a
//! follow-up existence check tells a lost race (`Stale`) from a missing record.

use chrono::{DateTime, SecondsFormat, Utc};
use dynaflow_core::repository::{CandidateQuery, CandidateTask, FlowStore, VersionedUpdate};
use dynaflow_types::catalog::{FlowType, TaskType};
use dynaflow_types::dependency::{NewTaskDependency, TaskDependency};
use dynaflow_types::error::RepositoryError;
use dynaflow_types::flow::{Flow, NewFlow};
use dynaflow_types::ids::{
    DependencyId, FlowId, FlowTypeId, OwnerId, ScheduleId, TaskId, TaskTypeId,
};
use dynaflow_types::schedule::{FlowSchedule, NewFlowSchedule};
use dynaflow_types::task::{NewTask, Task};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteExecutor};
use uuid::Uuid;

use super::pool::DatabasePool;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite-backed implementation of `FlowStore`.
#[derive(Clone)]
pub struct SqliteFlowStore {
    pool: DatabasePool,
}

impl SqliteFlowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct FlowRow {
    id: i64,
    code: String,
    last_change_code: String,
    owner_id: i64,
    type_id: i64,
    description: String,
    priority_level: i32,
    parent_flow_id: Option<i64>,
    root_flow_id: Option<i64>,
    dependency_flow_id: Option<i64>,
    subject_code: Option<String>,
    param1: Option<String>,
    requested_at: String,
    min_start_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    is_paused: bool,
    is_cancel_requested: bool,
    is_canceled: bool,
    is_started: bool,
    is_completed: bool,
    is_successful: bool,
    is_resubmitted: bool,
    is_task_creation_started: bool,
    is_tasks_created: bool,
    is_build_task_debug_required: bool,
    is_run_task_debug_required: bool,
    task_creation_processor_identifier: Option<String>,
    result_value: Option<String>,
}

impl FlowRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            last_change_code: row.try_get("last_change_code")?,
            owner_id: row.try_get("owner_id")?,
            type_id: row.try_get("type_id")?,
            description: row.try_get("description")?,
            priority_level: row.try_get("priority_level")?,
            parent_flow_id: row.try_get("parent_flow_id")?,
            root_flow_id: row.try_get("root_flow_id")?,
            dependency_flow_id: row.try_get("dependency_flow_id")?,
            subject_code: row.try_get("subject_code")?,
            param1: row.try_get("param1")?,
            requested_at: row.try_get("requested_at")?,
            min_start_at: row.try_get("min_start_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            is_paused: row.try_get("is_paused")?,
            is_cancel_requested: row.try_get("is_cancel_requested")?,
            is_canceled: row.try_get("is_canceled")?,
            is_started: row.try_get("is_started")?,
            is_completed: row.try_get("is_completed")?,
            is_successful: row.try_get("is_successful")?,
            is_resubmitted: row.try_get("is_resubmitted")?,
            is_task_creation_started: row.try_get("is_task_creation_started")?,
            is_tasks_created: row.try_get("is_tasks_created")?,
            is_build_task_debug_required: row.try_get("is_build_task_debug_required")?,
            is_run_task_debug_required: row.try_get("is_run_task_debug_required")?,
            task_creation_processor_identifier: row.try_get("task_creation_processor_identifier")?,
            result_value: row.try_get("result_value")?,
        })
    }

    fn into_flow(self) -> Result<Flow, RepositoryError> {
        Ok(Flow {
            id: FlowId(self.id),
            code: parse_uuid(&self.code)?,
            last_change_code: parse_uuid(&self.last_change_code)?,
            owner_id: OwnerId(self.owner_id),
            type_id: FlowTypeId(self.type_id),
            description: self.description,
            priority_level: self.priority_level,
            parent_flow_id: self.parent_flow_id.and_then(FlowId::from_raw),
            root_flow_id: self
                .root_flow_id
                .and_then(FlowId::from_raw)
                .unwrap_or(FlowId(self.id)),
            dependency_flow_id: self.dependency_flow_id.and_then(FlowId::from_raw),
            subject_code: self.subject_code.as_deref().map(parse_uuid).transpose()?,
            param1: self.param1,
            requested_at: parse_datetime(&self.requested_at)?,
            min_start_at: parse_datetime(&self.min_start_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            is_paused: self.is_paused,
            is_cancel_requested: self.is_cancel_requested,
            is_canceled: self.is_canceled,
            is_started: self.is_started,
            is_completed: self.is_completed,
            is_successful: self.is_successful,
            is_resubmitted: self.is_resubmitted,
            is_task_creation_started: self.is_task_creation_started,
            is_tasks_created: self.is_tasks_created,
            is_build_task_debug_required: self.is_build_task_debug_required,
            is_run_task_debug_required: self.is_run_task_debug_required,
            task_creation_processor_identifier: self.task_creation_processor_identifier,
            result_value: self.result_value,
        })
    }
}

struct TaskRow {
    id: i64,
    code: String,
    last_change_code: String,
    flow_id: i64,
    flow_subject_code: Option<String>,
    type_id: i64,
    description: String,
    dependency_task_id: Option<i64>,
    max_retry_count: i64,
    retry_count: i64,
    is_parallel_run_allowed: bool,
    requested_at: String,
    min_start_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    is_cancel_requested: bool,
    is_canceled: bool,
    is_started: bool,
    is_completed: bool,
    is_successful: bool,
    is_resubmitted: bool,
    processor_identifier: Option<String>,
    param1: Option<String>,
    param2: Option<String>,
    result_value: Option<String>,
}

impl TaskRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            last_change_code: row.try_get("last_change_code")?,
            flow_id: row.try_get("flow_id")?,
            flow_subject_code: row.try_get("flow_subject_code")?,
            type_id: row.try_get("type_id")?,
            description: row.try_get("description")?,
            dependency_task_id: row.try_get("dependency_task_id")?,
            max_retry_count: row.try_get("max_retry_count")?,
            retry_count: row.try_get("retry_count")?,
            is_parallel_run_allowed: row.try_get("is_parallel_run_allowed")?,
            requested_at: row.try_get("requested_at")?,
            min_start_at: row.try_get("min_start_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            is_cancel_requested: row.try_get("is_cancel_requested")?,
            is_canceled: row.try_get("is_canceled")?,
            is_started: row.try_get("is_started")?,
            is_completed: row.try_get("is_completed")?,
            is_successful: row.try_get("is_successful")?,
            is_resubmitted: row.try_get("is_resubmitted")?,
            processor_identifier: row.try_get("processor_identifier")?,
            param1: row.try_get("param1")?,
            param2: row.try_get("param2")?,
            result_value: row.try_get("result_value")?,
        })
    }

    fn into_task(self) -> Result<Task, RepositoryError> {
        Ok(Task {
            id: TaskId(self.id),
            code: parse_uuid(&self.code)?,
            last_change_code: parse_uuid(&self.last_change_code)?,
            flow_id: FlowId(self.flow_id),
            flow_subject_code: self.flow_subject_code.as_deref().map(parse_uuid).transpose()?,
            type_id: TaskTypeId(self.type_id),
            description: self.description,
            dependency_task_id: self.dependency_task_id.and_then(TaskId::from_raw),
            max_retry_count: to_u32(self.max_retry_count, "max_retry_count")?,
            retry_count: to_u32(self.retry_count, "retry_count")?,
            is_parallel_run_allowed: self.is_parallel_run_allowed,
            requested_at: parse_datetime(&self.requested_at)?,
            min_start_at: parse_datetime(&self.min_start_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            is_cancel_requested: self.is_cancel_requested,
            is_canceled: self.is_canceled,
            is_started: self.is_started,
            is_completed: self.is_completed,
            is_successful: self.is_successful,
            is_resubmitted: self.is_resubmitted,
            processor_identifier: self.processor_identifier,
            param1: self.param1,
            param2: self.param2,
            result_value: self.result_value,
        })
    }
}

fn dependency_from_row(row: &SqliteRow) -> Result<TaskDependency, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(query_error)?;
    let code: String = row.try_get("code").map_err(query_error)?;
    let last_change_code: String = row.try_get("last_change_code").map_err(query_error)?;
    let task_id: i64 = row.try_get("task_id").map_err(query_error)?;
    let dependency_task_id: Option<i64> = row.try_get("dependency_task_id").map_err(query_error)?;
    let is_placeholder: bool = row.try_get("is_placeholder").map_err(query_error)?;
    Ok(TaskDependency {
        id: DependencyId(id),
        code: parse_uuid(&code)?,
        last_change_code: parse_uuid(&last_change_code)?,
        task_id: TaskId(task_id),
        dependency_task_id: dependency_task_id.and_then(TaskId::from_raw),
        is_placeholder,
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<FlowSchedule, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(query_error)?;
    let code: String = row.try_get("code").map_err(query_error)?;
    let last_change_code: String = row.try_get("last_change_code").map_err(query_error)?;
    let owner_id: i64 = row.try_get("owner_id").map_err(query_error)?;
    let flow_type_id: i64 = row.try_get("flow_type_id").map_err(query_error)?;
    let frequency_in_hours: i64 = row.try_get("frequency_in_hours").map_err(query_error)?;
    let is_active: bool = row.try_get("is_active").map_err(query_error)?;
    let last_run_at: Option<String> = row.try_get("last_run_at").map_err(query_error)?;
    let next_run_at: String = row.try_get("next_run_at").map_err(query_error)?;
    let param1: Option<String> = row.try_get("param1").map_err(query_error)?;
    Ok(FlowSchedule {
        id: ScheduleId(id),
        code: parse_uuid(&code)?,
        last_change_code: parse_uuid(&last_change_code)?,
        owner_id: OwnerId(owner_id),
        flow_type_id: FlowTypeId(flow_type_id),
        frequency_in_hours: to_u32(frequency_in_hours, "frequency_in_hours")?,
        is_active,
        last_run_at: last_run_at.as_deref().map(parse_datetime).transpose()?,
        next_run_at: parse_datetime(&next_run_at)?,
        param1,
    })
}

fn flow_type_from_row(row: &SqliteRow) -> Result<FlowType, RepositoryError> {
    Ok(FlowType {
        id: FlowTypeId(row.try_get("id").map_err(query_error)?),
        pac_id: OwnerId(row.try_get("pac_id").map_err(query_error)?),
        name: row.try_get("name").map_err(query_error)?,
        lookup_enum_name: row.try_get("lookup_enum_name").map_err(query_error)?,
        description: row.try_get("description").map_err(query_error)?,
        priority_level: row.try_get("priority_level").map_err(query_error)?,
        display_order: row.try_get("display_order").map_err(query_error)?,
        is_active: row.try_get("is_active").map_err(query_error)?,
    })
}

fn task_type_from_row(row: &SqliteRow) -> Result<TaskType, RepositoryError> {
    let max_retry_count: i64 = row.try_get("max_retry_count").map_err(query_error)?;
    Ok(TaskType {
        id: TaskTypeId(row.try_get("id").map_err(query_error)?),
        pac_id: OwnerId(row.try_get("pac_id").map_err(query_error)?),
        name: row.try_get("name").map_err(query_error)?,
        lookup_enum_name: row.try_get("lookup_enum_name").map_err(query_error)?,
        description: row.try_get("description").map_err(query_error)?,
        priority_level: row.try_get("priority_level").map_err(query_error)?,
        display_order: row.try_get("display_order").map_err(query_error)?,
        is_active: row.try_get("is_active").map_err(query_error)?,
        max_retry_count: to_u32(max_retry_count, "max_retry_count")?,
        is_parallel_run_allowed: row.try_get("is_parallel_run_allowed").map_err(query_error)?,
    })
}

fn rows_to_flows(rows: &[SqliteRow]) -> Result<Vec<Flow>, RepositoryError> {
    rows.iter()
        .map(|row| FlowRow::from_row(row).map_err(query_error)?.into_flow())
        .collect()
}

fn rows_to_tasks(rows: &[SqliteRow]) -> Result<Vec<Task>, RepositoryError> {
    rows.iter()
        .map(|row| TaskRow::from_row(row).map_err(query_error)?.into_task())
        .collect()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC form; due-time filters compare these as text.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_u32(value: i64, column: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("{column} out of range: {value}")))
}

/// Map a sqlx error, flagging lock contention and pool exhaustion as transient.
fn query_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("database is locked") || message.contains("database is busy") {
                RepositoryError::Transient(message.to_string())
            } else if message.contains("UNIQUE") || message.contains("FOREIGN KEY") {
                RepositoryError::Conflict(message.to_string())
            } else {
                RepositoryError::Query(e.to_string())
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => RepositoryError::Transient(e.to_string()),
        sqlx::Error::PoolClosed => RepositoryError::Connection,
        _ => RepositoryError::Query(e.to_string()),
    }
}

async fn fetch_flow<'e, E: SqliteExecutor<'e>>(executor: E, id: i64) -> Result<Option<Flow>, RepositoryError> {
    let row = sqlx::query("SELECT * FROM dyna_flows WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(query_error)?;
    match row {
        Some(row) => Ok(Some(FlowRow::from_row(&row).map_err(query_error)?.into_flow()?)),
        None => Ok(None),
    }
}

async fn fetch_task<'e, E: SqliteExecutor<'e>>(executor: E, id: i64) -> Result<Option<Task>, RepositoryError> {
    let row = sqlx::query("SELECT * FROM dyna_flow_tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(query_error)?;
    match row {
        Some(row) => Ok(Some(TaskRow::from_row(&row).map_err(query_error)?.into_task()?)),
        None => Ok(None),
    }
}

const INSERT_TASK: &str = r#"INSERT INTO dyna_flow_tasks
    (code, last_change_code, flow_id, flow_subject_code, type_id, description,
     dependency_task_id, max_retry_count, retry_count, is_parallel_run_allowed,
     requested_at, min_start_at, param1, param2)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)"#;

fn bind_new_task<'q>(query: SqliteQuery<'q>, task: &'q NewTask) -> SqliteQuery<'q> {
    query
        .bind(Uuid::now_v7().to_string())
        .bind(Uuid::now_v7().to_string())
        .bind(task.flow_id.get())
        .bind(task.flow_subject_code.map(|c| c.to_string()))
        .bind(task.type_id.get())
        .bind(&task.description)
        .bind(task.dependency_task_id.map(TaskId::get))
        .bind(i64::from(task.max_retry_count))
        .bind(task.is_parallel_run_allowed)
        .bind(format_datetime(&task.requested_at))
        .bind(format_datetime(&task.min_start_at))
        .bind(task.param1.as_deref())
        .bind(task.param2.as_deref())
}

/// Mutable task columns, in the order `bind_task_update` binds them.
const TASK_UPDATE_SET: &str = "description = ?, dependency_task_id = ?, max_retry_count = ?, \
     retry_count = ?, is_parallel_run_allowed = ?, min_start_at = ?, started_at = ?, \
     completed_at = ?, is_cancel_requested = ?, is_canceled = ?, is_started = ?, \
     is_completed = ?, is_successful = ?, is_resubmitted = ?, processor_identifier = ?, \
     param1 = ?, param2 = ?, result_value = ?, last_change_code = ?";

fn bind_task_update<'q>(query: SqliteQuery<'q>, task: &'q Task, version: Uuid) -> SqliteQuery<'q> {
    query
        .bind(&task.description)
        .bind(task.dependency_task_id.map(TaskId::get))
        .bind(i64::from(task.max_retry_count))
        .bind(i64::from(task.retry_count))
        .bind(task.is_parallel_run_allowed)
        .bind(format_datetime(&task.min_start_at))
        .bind(task.started_at.as_ref().map(format_datetime))
        .bind(task.completed_at.as_ref().map(format_datetime))
        .bind(task.is_cancel_requested)
        .bind(task.is_canceled)
        .bind(task.is_started)
        .bind(task.is_completed)
        .bind(task.is_successful)
        .bind(task.is_resubmitted)
        .bind(task.processor_identifier.as_deref())
        .bind(task.param1.as_deref())
        .bind(task.param2.as_deref())
        .bind(task.result_value.as_deref())
        .bind(version.to_string())
}

impl SqliteFlowStore {
    /// Resolve a zero-row version-checked update into `Stale` or `NotFound`.
    async fn settle(
        &self,
        table: &'static str,
        id: i64,
        rows_affected: u64,
        version: Uuid,
    ) -> Result<VersionedUpdate, RepositoryError> {
        if rows_affected > 0 {
            return Ok(VersionedUpdate::Applied(version));
        }
        let exists = sqlx::query(&format!("SELECT 1 FROM {table} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        match exists {
            Some(_) => Ok(VersionedUpdate::Stale),
            None => Err(RepositoryError::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// FlowStore impl
// ---------------------------------------------------------------------------

impl FlowStore for SqliteFlowStore {
    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    async fn create_flow(&self, flow: &NewFlow) -> Result<Flow, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            r#"INSERT INTO dyna_flows
               (code, last_change_code, owner_id, type_id, description, priority_level,
                parent_flow_id, root_flow_id, dependency_flow_id, subject_code, param1,
                requested_at, min_start_at, is_task_creation_started,
                is_build_task_debug_required, is_run_task_debug_required,
                task_creation_processor_identifier)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(Uuid::now_v7().to_string())
        .bind(flow.owner_id.get())
        .bind(flow.type_id.get())
        .bind(&flow.description)
        .bind(flow.priority_level)
        .bind(flow.parent_flow_id.map(FlowId::get))
        .bind(flow.root_flow_id.map(FlowId::get))
        .bind(flow.dependency_flow_id.map(FlowId::get))
        .bind(flow.subject_code.map(|c| c.to_string()))
        .bind(flow.param1.as_deref())
        .bind(format_datetime(&flow.requested_at))
        .bind(format_datetime(&flow.min_start_at))
        .bind(flow.task_creation_processor_identifier.is_some())
        .bind(flow.is_build_task_debug_required)
        .bind(flow.is_run_task_debug_required)
        .bind(flow.task_creation_processor_identifier.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;
        let id = result.last_insert_rowid();

        if flow.root_flow_id.is_none() {
            sqlx::query("UPDATE dyna_flows SET root_flow_id = ? WHERE id = ?")
                .bind(id)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
        }

        let created = fetch_flow(&mut *tx, id).await?.ok_or(RepositoryError::NotFound)?;
        tx.commit().await.map_err(query_error)?;
        Ok(created)
    }

    async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>, RepositoryError> {
        fetch_flow(&self.pool.reader, id.get()).await
    }

    async fn get_flow_by_code(&self, code: &Uuid) -> Result<Option<Flow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM dyna_flows WHERE code = ?")
            .bind(code.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        match row {
            Some(row) => Ok(Some(FlowRow::from_row(&row).map_err(query_error)?.into_flow()?)),
            None => Ok(None),
        }
    }

    async fn list_flows_by_owner(
        &self,
        owner_id: OwnerId,
        limit: u32,
    ) -> Result<Vec<Flow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM dyna_flows WHERE owner_id = ? ORDER BY requested_at DESC, id DESC LIMIT ?",
        )
        .bind(owner_id.get())
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows_to_flows(&rows)
    }

    async fn list_dependent_flows(&self, flow_id: FlowId) -> Result<Vec<Flow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM dyna_flows WHERE id <> ? AND (parent_flow_id = ? OR dependency_flow_id = ?) ORDER BY id",
        )
        .bind(flow_id.get())
        .bind(flow_id.get())
        .bind(flow_id.get())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows_to_flows(&rows)
    }

    async fn list_flows_pending_task_build(
        &self,
        owner_id: Option<OwnerId>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Flow>, RepositoryError> {
        let owner = owner_id.map(OwnerId::get);
        let rows = sqlx::query(
            r#"SELECT * FROM dyna_flows
               WHERE is_task_creation_started = 0 AND is_tasks_created = 0
                 AND is_paused = 0 AND is_cancel_requested = 0
                 AND is_completed = 0 AND is_canceled = 0
                 AND min_start_at <= ?
                 AND (? IS NULL OR owner_id = ?)
               ORDER BY priority_level ASC, requested_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(owner)
        .bind(owner)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows_to_flows(&rows)
    }

    async fn list_flows_pending_cancel(
        &self,
        owner_id: Option<OwnerId>,
        limit: u32,
    ) -> Result<Vec<Flow>, RepositoryError> {
        let owner = owner_id.map(OwnerId::get);
        let rows = sqlx::query(
            r#"SELECT * FROM dyna_flows
               WHERE is_cancel_requested = 1 AND is_canceled = 0 AND is_completed = 0
                 AND (? IS NULL OR owner_id = ?)
               ORDER BY id ASC
               LIMIT ?"#,
        )
        .bind(owner)
        .bind(owner)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows_to_flows(&rows)
    }

    async fn update_flow(&self, flow: &Flow, expected: Uuid) -> Result<VersionedUpdate, RepositoryError> {
        let version = Uuid::now_v7();
        let result = sqlx::query(
            r#"UPDATE dyna_flows SET
                 description = ?, priority_level = ?, dependency_flow_id = ?, param1 = ?,
                 min_start_at = ?, started_at = ?, completed_at = ?,
                 is_paused = ?, is_cancel_requested = ?, is_canceled = ?, is_started = ?,
                 is_completed = ?, is_successful = ?, is_resubmitted = ?,
                 is_task_creation_started = ?, is_tasks_created = ?,
                 is_build_task_debug_required = ?, is_run_task_debug_required = ?,
                 task_creation_processor_identifier = ?, result_value = ?,
                 last_change_code = ?
               WHERE id = ? AND last_change_code = ?"#,
        )
        .bind(&flow.description)
        .bind(flow.priority_level)
        .bind(flow.dependency_flow_id.map(FlowId::get))
        .bind(flow.param1.as_deref())
        .bind(format_datetime(&flow.min_start_at))
        .bind(flow.started_at.as_ref().map(format_datetime))
        .bind(flow.completed_at.as_ref().map(format_datetime))
        .bind(flow.is_paused)
        .bind(flow.is_cancel_requested)
        .bind(flow.is_canceled)
        .bind(flow.is_started)
        .bind(flow.is_completed)
        .bind(flow.is_successful)
        .bind(flow.is_resubmitted)
        .bind(flow.is_task_creation_started)
        .bind(flow.is_tasks_created)
        .bind(flow.is_build_task_debug_required)
        .bind(flow.is_run_task_debug_required)
        .bind(flow.task_creation_processor_identifier.as_deref())
        .bind(flow.result_value.as_deref())
        .bind(version.to_string())
        .bind(flow.id.get())
        .bind(expected.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        self.settle("dyna_flows", flow.id.get(), result.rows_affected(), version)
            .await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    async fn create_task(&self, task: &NewTask) -> Result<Task, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let result = bind_new_task(sqlx::query(INSERT_TASK), task)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        let created = fetch_task(&mut *tx, result.last_insert_rowid())
            .await?
            .ok_or(RepositoryError::NotFound)?;
        tx.commit().await.map_err(query_error)?;
        Ok(created)
    }

    async fn create_tasks(&self, tasks: &[NewTask]) -> Result<Vec<Task>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            let result = bind_new_task(sqlx::query(INSERT_TASK), task)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
            let stored = fetch_task(&mut *tx, result.last_insert_rowid())
                .await?
                .ok_or(RepositoryError::NotFound)?;
            created.push(stored);
        }
        tx.commit().await.map_err(query_error)?;
        Ok(created)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, RepositoryError> {
        fetch_task(&self.pool.reader, id.get()).await
    }

    async fn get_task_by_code(&self, code: &Uuid) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM dyna_flow_tasks WHERE code = ?")
            .bind(code.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        match row {
            Some(row) => Ok(Some(TaskRow::from_row(&row).map_err(query_error)?.into_task()?)),
            None => Ok(None),
        }
    }

    async fn list_tasks_by_flow(&self, flow_id: FlowId) -> Result<Vec<Task>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM dyna_flow_tasks WHERE flow_id = ? ORDER BY id ASC")
            .bind(flow_id.get())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows_to_tasks(&rows)
    }

    async fn list_candidate_tasks(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<CandidateTask>, RepositoryError> {
        if query.task_type_ids.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"SELECT t.*, f.priority_level AS flow_priority_level
               FROM dyna_flow_tasks t
               JOIN dyna_flows f ON f.id = t.flow_id
               WHERE t.is_started = 0 AND t.is_completed = 0 AND t.is_canceled = 0
                 AND t.is_cancel_requested = 0
                 AND f.is_tasks_created = 1 AND f.is_paused = 0 AND f.is_cancel_requested = 0
                 AND f.is_completed = 0 AND f.is_canceled = 0
                 AND (t.dependency_task_id IS NULL OR EXISTS (
                   SELECT 1 FROM dyna_flow_tasks p
                   WHERE p.id = t.dependency_task_id
                     AND (p.is_completed = 1 OR p.is_canceled = 1)))
                 AND NOT EXISTS (
                   SELECT 1 FROM dyna_flow_task_dependencies d
                   LEFT JOIN dyna_flow_tasks p ON p.id = d.dependency_task_id
                   WHERE d.task_id = t.id
                     AND (d.is_placeholder = 1 OR p.id IS NULL
                          OR (p.is_completed = 0 AND p.is_canceled = 0)))
                 AND t.min_start_at <= "#,
        );
        qb.push_bind(format_datetime(&query.now));
        if let Some(owner_id) = query.owner_id {
            qb.push(" AND f.owner_id = ").push_bind(owner_id.get());
        }
        if let Some(type_ids) = &query.task_type_ids {
            qb.push(" AND t.type_id IN (");
            let mut separated = qb.separated(", ");
            for type_id in type_ids {
                separated.push_bind(type_id.get());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY f.priority_level ASC, t.requested_at ASC, t.id ASC LIMIT ")
            .push_bind(i64::from(query.limit));

        let rows = qb
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let flow_priority_level: i32 = row.try_get("flow_priority_level").map_err(query_error)?;
            let task = TaskRow::from_row(row).map_err(query_error)?.into_task()?;
            candidates.push(CandidateTask {
                task,
                flow_priority_level,
            });
        }
        Ok(candidates)
    }

    async fn update_task(&self, task: &Task, expected: Uuid) -> Result<VersionedUpdate, RepositoryError> {
        let version = Uuid::now_v7();
        let sql = format!("UPDATE dyna_flow_tasks SET {TASK_UPDATE_SET} WHERE id = ? AND last_change_code = ?");
        let result = bind_task_update(sqlx::query(&sql), task, version)
            .bind(task.id.get())
            .bind(expected.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        self.settle("dyna_flow_tasks", task.id.get(), result.rows_affected(), version)
            .await
    }

    async fn claim_task(&self, task: &Task, expected: Uuid) -> Result<VersionedUpdate, RepositoryError> {
        let version = Uuid::now_v7();
        let sql = format!(
            "UPDATE dyna_flow_tasks SET {TASK_UPDATE_SET} \
             WHERE id = ? AND last_change_code = ? \
               AND (? OR NOT EXISTS ( \
                 SELECT 1 FROM dyna_flow_tasks s \
                 WHERE s.flow_id = dyna_flow_tasks.flow_id \
                   AND s.type_id = dyna_flow_tasks.type_id \
                   AND s.id <> dyna_flow_tasks.id \
                   AND s.is_started = 1 AND s.is_completed = 0 AND s.is_canceled = 0))"
        );
        let result = bind_task_update(sqlx::query(&sql), task, version)
            .bind(task.id.get())
            .bind(expected.to_string())
            .bind(task.is_parallel_run_allowed)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        self.settle("dyna_flow_tasks", task.id.get(), result.rows_affected(), version)
            .await
    }

    // -----------------------------------------------------------------------
    // Dependency edges
    // -----------------------------------------------------------------------

    async fn create_dependency(
        &self,
        edge: &NewTaskDependency,
    ) -> Result<TaskDependency, RepositoryError> {
        let code = Uuid::now_v7();
        let version = Uuid::now_v7();
        let result = sqlx::query(
            r#"INSERT INTO dyna_flow_task_dependencies
               (code, last_change_code, task_id, dependency_task_id, is_placeholder)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(code.to_string())
        .bind(version.to_string())
        .bind(edge.task_id.get())
        .bind(edge.dependency_task_id.map(TaskId::get))
        .bind(edge.is_placeholder)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(TaskDependency {
            id: DependencyId(result.last_insert_rowid()),
            code,
            last_change_code: version,
            task_id: edge.task_id,
            dependency_task_id: edge.dependency_task_id,
            is_placeholder: edge.is_placeholder,
        })
    }

    async fn list_dependencies_for_task(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<TaskDependency>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM dyna_flow_task_dependencies WHERE task_id = ? ORDER BY id ASC")
            .bind(task_id.get())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter().map(dependency_from_row).collect()
    }

    async fn update_dependency(
        &self,
        edge: &TaskDependency,
        expected: Uuid,
    ) -> Result<VersionedUpdate, RepositoryError> {
        let version = Uuid::now_v7();
        let result = sqlx::query(
            r#"UPDATE dyna_flow_task_dependencies
               SET dependency_task_id = ?, is_placeholder = ?, last_change_code = ?
               WHERE id = ? AND last_change_code = ?"#,
        )
        .bind(edge.dependency_task_id.map(TaskId::get))
        .bind(edge.is_placeholder)
        .bind(version.to_string())
        .bind(edge.id.get())
        .bind(expected.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        self.settle("dyna_flow_task_dependencies", edge.id.get(), result.rows_affected(), version)
            .await
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    async fn create_schedule(
        &self,
        schedule: &NewFlowSchedule,
    ) -> Result<FlowSchedule, RepositoryError> {
        let code = Uuid::now_v7();
        let version = Uuid::now_v7();
        let result = sqlx::query(
            r#"INSERT INTO dyna_flow_schedules
               (code, last_change_code, owner_id, flow_type_id, frequency_in_hours,
                is_active, next_run_at, param1)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(code.to_string())
        .bind(version.to_string())
        .bind(schedule.owner_id.get())
        .bind(schedule.flow_type_id.get())
        .bind(i64::from(schedule.frequency_in_hours))
        .bind(schedule.is_active)
        .bind(format_datetime(&schedule.next_run_at))
        .bind(schedule.param1.as_deref())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let row = sqlx::query("SELECT * FROM dyna_flow_schedules WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool.writer)
            .await
            .map_err(query_error)?;
        schedule_from_row(&row)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<FlowSchedule>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM dyna_flow_schedules WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules(
        &self,
        owner_id: Option<OwnerId>,
    ) -> Result<Vec<FlowSchedule>, RepositoryError> {
        let owner = owner_id.map(OwnerId::get);
        let rows = sqlx::query(
            "SELECT * FROM dyna_flow_schedules WHERE (? IS NULL OR owner_id = ?) ORDER BY id ASC",
        )
        .bind(owner)
        .bind(owner)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn list_due_schedules(
        &self,
        owner_id: Option<OwnerId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FlowSchedule>, RepositoryError> {
        let owner = owner_id.map(OwnerId::get);
        let rows = sqlx::query(
            r#"SELECT * FROM dyna_flow_schedules
               WHERE is_active = 1 AND next_run_at <= ? AND (? IS NULL OR owner_id = ?)
               ORDER BY next_run_at ASC, id ASC"#,
        )
        .bind(format_datetime(&now))
        .bind(owner)
        .bind(owner)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn update_schedule(
        &self,
        schedule: &FlowSchedule,
        expected: Uuid,
    ) -> Result<VersionedUpdate, RepositoryError> {
        let version = Uuid::now_v7();
        let result = sqlx::query(
            r#"UPDATE dyna_flow_schedules
               SET frequency_in_hours = ?, is_active = ?, last_run_at = ?, next_run_at = ?,
                   param1 = ?, last_change_code = ?
               WHERE id = ? AND last_change_code = ?"#,
        )
        .bind(i64::from(schedule.frequency_in_hours))
        .bind(schedule.is_active)
        .bind(schedule.last_run_at.as_ref().map(format_datetime))
        .bind(format_datetime(&schedule.next_run_at))
        .bind(schedule.param1.as_deref())
        .bind(version.to_string())
        .bind(schedule.id.get())
        .bind(expected.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        self.settle("dyna_flow_schedules", schedule.id.get(), result.rows_affected(), version)
            .await
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    async fn upsert_flow_type(&self, flow_type: &FlowType) -> Result<FlowType, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO dyna_flow_types
               (pac_id, name, lookup_enum_name, description, priority_level, display_order, is_active)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(lookup_enum_name) DO UPDATE SET
                 pac_id = excluded.pac_id,
                 name = excluded.name,
                 description = excluded.description,
                 priority_level = excluded.priority_level,
                 display_order = excluded.display_order,
                 is_active = excluded.is_active"#,
        )
        .bind(flow_type.pac_id.get())
        .bind(&flow_type.name)
        .bind(&flow_type.lookup_enum_name)
        .bind(&flow_type.description)
        .bind(flow_type.priority_level)
        .bind(flow_type.display_order)
        .bind(flow_type.is_active)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let row = sqlx::query("SELECT * FROM dyna_flow_types WHERE lookup_enum_name = ?")
            .bind(&flow_type.lookup_enum_name)
            .fetch_one(&self.pool.writer)
            .await
            .map_err(query_error)?;
        flow_type_from_row(&row)
    }

    async fn list_flow_types(&self) -> Result<Vec<FlowType>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM dyna_flow_types ORDER BY display_order ASC, name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter().map(flow_type_from_row).collect()
    }

    async fn upsert_task_type(&self, task_type: &TaskType) -> Result<TaskType, RepositoryError> {
        sqlx::query(
            r#"INSERT INTO dyna_flow_task_types
               (pac_id, name, lookup_enum_name, description, priority_level, display_order,
                is_active, max_retry_count, is_parallel_run_allowed)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(lookup_enum_name) DO UPDATE SET
                 pac_id = excluded.pac_id,
                 name = excluded.name,
                 description = excluded.description,
                 priority_level = excluded.priority_level,
                 display_order = excluded.display_order,
                 is_active = excluded.is_active,
                 max_retry_count = excluded.max_retry_count,
                 is_parallel_run_allowed = excluded.is_parallel_run_allowed"#,
        )
        .bind(task_type.pac_id.get())
        .bind(&task_type.name)
        .bind(&task_type.lookup_enum_name)
        .bind(&task_type.description)
        .bind(task_type.priority_level)
        .bind(task_type.display_order)
        .bind(task_type.is_active)
        .bind(i64::from(task_type.max_retry_count))
        .bind(task_type.is_parallel_run_allowed)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let row = sqlx::query("SELECT * FROM dyna_flow_task_types WHERE lookup_enum_name = ?")
            .bind(&task_type.lookup_enum_name)
            .fetch_one(&self.pool.writer)
            .await
            .map_err(query_error)?;
        task_type_from_row(&row)
    }

    async fn list_task_types(&self) -> Result<Vec<TaskType>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM dyna_flow_task_types ORDER BY display_order ASC, name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter().map(task_type_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use dynaflow_core::engine::builder::{FlowBuilder, FlowRequest};
    use dynaflow_core::engine::catalog::CatalogCache;
    use dynaflow_core::engine::claimer::TaskClaimer;
    use dynaflow_core::engine::planner::{TaskPlan, TaskSpec};
    use dynaflow_core::event::EventBus;
    use dynaflow_types::config::EngineConfig;
    use std::sync::Arc;

    async fn test_store() -> SqliteFlowStore {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteFlowStore::new(DatabasePool::new(&url).await.unwrap())
    }

    fn flow_type(name: &str, priority: i32) -> FlowType {
        FlowType {
            id: FlowTypeId(0),
            pac_id: OwnerId(1),
            name: name.to_string(),
            lookup_enum_name: name.to_string(),
            description: String::new(),
            priority_level: priority,
            display_order: 0,
            is_active: true,
        }
    }

    fn task_type(name: &str, parallel: bool) -> TaskType {
        TaskType {
            id: TaskTypeId(0),
            pac_id: OwnerId(1),
            name: name.to_string(),
            lookup_enum_name: name.to_string(),
            description: String::new(),
            priority_level: 100,
            display_order: 0,
            is_active: true,
            max_retry_count: 1,
            is_parallel_run_allowed: parallel,
        }
    }

    async fn seeded() -> (Arc<SqliteFlowStore>, Arc<CatalogCache>) {
        let store = Arc::new(test_store().await);
        store.upsert_flow_type(&flow_type("import", 5)).await.unwrap();
        store.upsert_flow_type(&flow_type("urgent", 1)).await.unwrap();
        store.upsert_task_type(&task_type("echo", true)).await.unwrap();
        store.upsert_task_type(&task_type("exclusive", false)).await.unwrap();
        let catalog = Arc::new(CatalogCache::load(store.as_ref()).await.unwrap());
        (store, catalog)
    }

    fn new_flow(type_id: FlowTypeId) -> NewFlow {
        let now = Utc::now();
        NewFlow {
            owner_id: OwnerId(1),
            type_id,
            description: "nightly import".to_string(),
            priority_level: 5,
            parent_flow_id: None,
            root_flow_id: None,
            dependency_flow_id: None,
            subject_code: Some(Uuid::now_v7()),
            param1: Some("p".to_string()),
            requested_at: now,
            min_start_at: now,
            is_build_task_debug_required: false,
            is_run_task_debug_required: false,
            task_creation_processor_identifier: None,
        }
    }

    #[tokio::test]
    async fn create_flow_becomes_its_own_root() {
        let (store, catalog) = seeded().await;
        let type_id = catalog.flow_type("import").unwrap().id;
        let flow = store.create_flow(&new_flow(type_id)).await.unwrap();
        assert_eq!(flow.root_flow_id, flow.id);
        assert!(!flow.is_task_creation_started);

        let fetched = store.get_flow(flow.id).await.unwrap().unwrap();
        assert_eq!(fetched, flow);
        let by_code = store.get_flow_by_code(&flow.code).await.unwrap().unwrap();
        assert_eq!(by_code.id, flow.id);
    }

    #[tokio::test]
    async fn stale_flow_update_is_rejected() {
        let (store, catalog) = seeded().await;
        let type_id = catalog.flow_type("import").unwrap().id;
        let flow = store.create_flow(&new_flow(type_id)).await.unwrap();

        let mut paused = flow.clone();
        paused.is_paused = true;
        let first = store.update_flow(&paused, flow.last_change_code).await.unwrap();
        assert!(first.is_applied());

        let second = store.update_flow(&paused, flow.last_change_code).await.unwrap();
        assert_eq!(second, VersionedUpdate::Stale);

        let mut missing = flow.clone();
        missing.id = FlowId(9_999);
        assert!(matches!(
            store.update_flow(&missing, flow.last_change_code).await,
            Err(RepositoryError::NotFound)
        ));

        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(stored.is_paused);
        assert_eq!(Some(stored.last_change_code), first.version());
    }

    #[tokio::test]
    async fn missing_parent_is_a_conflict() {
        let (store, catalog) = seeded().await;
        let type_id = catalog.flow_type("import").unwrap().id;
        let mut orphan = new_flow(type_id);
        orphan.parent_flow_id = Some(FlowId(4_242));
        orphan.root_flow_id = Some(FlowId(4_242));
        assert!(matches!(
            store.create_flow(&orphan).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn upsert_keeps_id_per_lookup_name() {
        let (store, _) = seeded().await;
        let before = store.list_flow_types().await.unwrap();
        let mut renamed = flow_type("import", 7);
        renamed.name = "Import v2".to_string();
        let updated = store.upsert_flow_type(&renamed).await.unwrap();

        let original = before.iter().find(|t| t.lookup_enum_name == "import").unwrap();
        assert_eq!(updated.id, original.id);
        assert_eq!(updated.priority_level, 7);
        assert_eq!(store.list_flow_types().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn builder_and_claimer_work_against_sqlite() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog.clone(), 5);
        let plan = TaskPlan::new()
            .task(TaskSpec::new("second", "echo").depends_on("first"))
            .task(TaskSpec::new("first", "echo"));
        let (normal, _) = builder
            .submit_flow(&FlowRequest::new(OwnerId(1), "import"), &plan, "api")
            .await
            .unwrap();
        let (urgent, urgent_tasks) = builder
            .submit_flow(&FlowRequest::new(OwnerId(1), "urgent"), &plan, "api")
            .await
            .unwrap();

        let edges = store.list_dependencies_for_task(urgent_tasks[0].id).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].is_resolved());
        assert_eq!(edges[0].dependency_task_id, Some(urgent_tasks[1].id));

        let claimer = TaskClaimer::new(store.clone(), EventBus::default(), &EngineConfig::default(), "p1");
        let leased = claimer.claim(1, None).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].flow_id, urgent.id);
        assert_eq!(leased[0].id, urgent_tasks[1].id);

        let stored = store.get_task(leased[0].id).await.unwrap().unwrap();
        assert!(stored.is_started);
        assert_eq!(stored.processor_identifier.as_deref(), Some("p1"));

        let flow = store.get_flow(urgent.id).await.unwrap().unwrap();
        assert!(flow.is_started);
        let normal = store.get_flow(normal.id).await.unwrap().unwrap();
        assert!(!normal.is_started);
    }

    #[tokio::test]
    async fn claim_respects_parallel_exclusion() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog.clone(), 5);
        let plan = TaskPlan::new()
            .task(TaskSpec::new("a", "exclusive"))
            .task(TaskSpec::new("b", "exclusive"));
        let (_, tasks) = builder
            .submit_flow(&FlowRequest::new(OwnerId(1), "import"), &plan, "api")
            .await
            .unwrap();

        let mut first = tasks[0].clone();
        first.is_started = true;
        first.started_at = Some(Utc::now());
        assert!(store.claim_task(&first, tasks[0].last_change_code).await.unwrap().is_applied());

        let mut second = tasks[1].clone();
        second.is_started = true;
        second.started_at = Some(Utc::now());
        assert_eq!(
            store.claim_task(&second, tasks[1].last_change_code).await.unwrap(),
            VersionedUpdate::Stale
        );
    }

    #[tokio::test]
    async fn candidates_skip_future_and_filtered_types() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog.clone(), 5);
        let plan = TaskPlan::new().task(TaskSpec::new("a", "echo"));
        builder
            .submit_flow(
                &FlowRequest::new(OwnerId(1), "import").start_after(Utc::now() + Duration::hours(1)),
                &plan,
                "api",
            )
            .await
            .unwrap();
        builder
            .submit_flow(&FlowRequest::new(OwnerId(1), "import"), &plan, "api")
            .await
            .unwrap();

        let query = |types: Option<Vec<TaskTypeId>>| CandidateQuery {
            owner_id: Some(OwnerId(1)),
            now: Utc::now(),
            task_type_ids: types,
            limit: 10,
        };
        assert_eq!(store.list_candidate_tasks(&query(None)).await.unwrap().len(), 1);
        let exclusive_only = catalog.task_type_ids_for(["exclusive"]);
        assert!(store.list_candidate_tasks(&query(Some(exclusive_only))).await.unwrap().is_empty());
        assert!(store.list_candidate_tasks(&query(Some(Vec::new()))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedules_round_trip_and_advance() {
        let (store, catalog) = seeded().await;
        let now = Utc::now();
        let schedule = store
            .create_schedule(&NewFlowSchedule {
                owner_id: OwnerId(1),
                flow_type_id: catalog.flow_type("import").unwrap().id,
                frequency_in_hours: 24,
                is_active: true,
                next_run_at: now - Duration::minutes(1),
                param1: None,
            })
            .await
            .unwrap();

        let due = store.list_due_schedules(None, now).await.unwrap();
        assert_eq!(due.len(), 1);

        let mut advanced = due[0].clone();
        advanced.last_run_at = Some(now);
        advanced.next_run_at = due[0].next_run_after(now).unwrap();
        assert!(store.update_schedule(&advanced, schedule.last_change_code).await.unwrap().is_applied());
        assert_eq!(
            store.update_schedule(&advanced, schedule.last_change_code).await.unwrap(),
            VersionedUpdate::Stale
        );
        assert!(store.list_due_schedules(None, now).await.unwrap().is_empty());
        assert_eq!(store.list_schedules(Some(OwnerId(1))).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn candidates_leave_out_tasks_waiting_on_predecessors() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog.clone(), 5);
        let plan = TaskPlan::new()
            .task(TaskSpec::new("d0", "echo").depends_on("root"))
            .task(TaskSpec::new("d1", "echo").depends_on("root"))
            .task(TaskSpec::new("d2", "echo").depends_on("root"))
            .task(TaskSpec::new("root", "echo"));
        let (_, tasks) = builder
            .submit_flow(&FlowRequest::new(OwnerId(1), "import"), &plan, "api")
            .await
            .unwrap();

        let query = CandidateQuery {
            owner_id: None,
            now: Utc::now(),
            task_type_ids: None,
            limit: 2,
        };
        let candidates = store.list_candidate_tasks(&query).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].task.id, tasks[3].id);

        let mut failed = tasks[3].clone();
        failed.is_started = true;
        failed.is_completed = true;
        failed.completed_at = Some(Utc::now());
        store.update_task(&failed, tasks[3].last_change_code).await.unwrap();

        // Doomed dependents surface so the claimer can cancel them.
        let candidates = store.list_candidate_tasks(&query).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.task.id != tasks[3].id));
    }

    #[tokio::test]
    async fn create_tasks_is_ordered_and_atomic() {
        let (store, catalog) = seeded().await;
        let type_id = catalog.flow_type("import").unwrap().id;
        let echo = catalog.task_type("echo").unwrap().id;
        let flow = store.create_flow(&new_flow(type_id)).await.unwrap();
        let now = Utc::now();
        let new_task = |flow_id: FlowId, description: &str| NewTask {
            flow_id,
            flow_subject_code: None,
            type_id: echo,
            description: description.to_string(),
            dependency_task_id: None,
            max_retry_count: 0,
            is_parallel_run_allowed: true,
            requested_at: now,
            min_start_at: now,
            param1: None,
            param2: None,
        };

        let batch = [new_task(flow.id, "c"), new_task(flow.id, "a"), new_task(flow.id, "b")];
        let created = store.create_tasks(&batch).await.unwrap();
        let descriptions: Vec<&str> = created.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(descriptions, ["c", "a", "b"]);
        assert!(created.windows(2).all(|w| w[0].id < w[1].id));

        let broken = [new_task(flow.id, "kept out"), new_task(FlowId(9_999), "orphan")];
        assert!(matches!(
            store.create_tasks(&broken).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert_eq!(store.list_tasks_by_flow(flow.id).await.unwrap().len(), 3);
    }
}
