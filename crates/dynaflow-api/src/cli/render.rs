//! Shared terminal rendering for flows, tasks and schedules.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dynaflow_core::engine::catalog::CatalogCache;
use dynaflow_types::flow::{Flow, FlowStatus};
use dynaflow_types::schedule::FlowSchedule;
use dynaflow_types::task::{Task, TaskStatus};

pub fn flow_status_cell(status: FlowStatus) -> Cell {
    let color = match status {
        FlowStatus::Requested => Color::White,
        FlowStatus::Paused => Color::Yellow,
        FlowStatus::Started => Color::Blue,
        FlowStatus::Succeeded => Color::Green,
        FlowStatus::Failed => Color::Red,
        FlowStatus::Canceled => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}

pub fn task_status_cell(status: TaskStatus) -> Cell {
    let color = match status {
        TaskStatus::Pending => Color::White,
        TaskStatus::Running => Color::Blue,
        TaskStatus::Succeeded => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Canceled => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}

fn table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn flow_type_name(catalog: &CatalogCache, flow: &Flow) -> String {
    catalog
        .flow_type_by_id(flow.type_id)
        .map(|t| t.lookup_enum_name)
        .unwrap_or_else(|| flow.type_id.to_string())
}

pub fn flows_table(catalog: &CatalogCache, flows: &[Flow]) -> Table {
    let mut table = table(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Type"),
        Cell::new("Status"),
        Cell::new("Priority"),
        Cell::new("Requested"),
        Cell::new("Description"),
    ]);
    for flow in flows {
        table.add_row(vec![
            Cell::new(flow.id),
            Cell::new(flow_type_name(catalog, flow)),
            flow_status_cell(flow.status()),
            Cell::new(flow.priority_level),
            Cell::new(flow.requested_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(&flow.description),
        ]);
    }
    table
}

pub fn tasks_table(catalog: &CatalogCache, tasks: &[Task]) -> Table {
    let mut table = table(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Type"),
        Cell::new("Status"),
        Cell::new("Retries"),
        Cell::new("After"),
        Cell::new("Processor"),
        Cell::new("Result"),
    ]);
    for task in tasks {
        let type_name = catalog
            .task_type_by_id(task.type_id)
            .map(|t| t.lookup_enum_name)
            .unwrap_or_else(|| task.type_id.to_string());
        table.add_row(vec![
            Cell::new(task.id),
            Cell::new(type_name),
            task_status_cell(task.status()),
            Cell::new(format!("{}/{}", task.retry_count, task.max_retry_count)),
            Cell::new(task.dependency_task_id.map(|id| id.to_string()).unwrap_or_default()),
            Cell::new(task.processor_identifier.as_deref().unwrap_or("")),
            Cell::new(task.result_value.as_deref().unwrap_or("")),
        ]);
    }
    table
}

pub fn schedules_table(catalog: &CatalogCache, schedules: &[FlowSchedule]) -> Table {
    let mut table = table(vec![
        Cell::new("ID").fg(Color::Cyan),
        Cell::new("Owner"),
        Cell::new("Flow type"),
        Cell::new("Every"),
        Cell::new("Active"),
        Cell::new("Last run"),
        Cell::new("Next run"),
    ]);
    for schedule in schedules {
        let type_name = catalog
            .flow_type_by_id(schedule.flow_type_id)
            .map(|t| t.lookup_enum_name)
            .unwrap_or_else(|| schedule.flow_type_id.to_string());
        table.add_row(vec![
            Cell::new(schedule.id),
            Cell::new(schedule.owner_id),
            Cell::new(type_name),
            Cell::new(format!("{}h", schedule.frequency_in_hours)),
            Cell::new(if schedule.is_active { "yes" } else { "no" }),
            Cell::new(
                schedule
                    .last_run_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string()),
            ),
            Cell::new(schedule.next_run_at.format("%Y-%m-%d %H:%M")),
        ]);
    }
    table
}

/// One-line confirmation in the CLI's house style.
pub fn done(message: impl std::fmt::Display) {
    println!();
    println!("  {} {message}", style("*").green().bold());
    println!();
}

/// Print a value as pretty JSON.
pub fn json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
