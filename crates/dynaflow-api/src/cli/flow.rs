//! CLI flow subcommands: submit, show, list, cancel, pause, resume, release,
//! resubmit.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use console::style;
use uuid::Uuid;

use dynaflow_core::engine::builder::FlowRequest;
use dynaflow_core::engine::versioned::update_flow_with;
use dynaflow_core::repository::FlowStore;
use dynaflow_types::flow::Flow;
use dynaflow_types::ids::{FlowId, OwnerId};

use super::render;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum FlowCommand {
    /// Request a new flow. A processor builds its tasks from the flow type's planner.
    Submit {
        /// Flow type lookup name (see `dynaflow catalog list`).
        flow_type: String,

        /// Owner (tenant) id.
        #[arg(long)]
        owner: i64,

        /// Opaque payload handed to the planner.
        #[arg(long)]
        param1: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// Business entity this flow concerns.
        #[arg(long)]
        subject: Option<Uuid>,

        /// Parent flow id.
        #[arg(long)]
        parent: Option<i64>,

        /// Do not build tasks until this flow has succeeded.
        #[arg(long)]
        after: Option<i64>,

        /// Override the flow type's priority (lower runs first).
        #[arg(long)]
        priority: Option<i32>,

        /// Earliest start time (RFC 3339).
        #[arg(long)]
        start_at: Option<DateTime<Utc>>,

        /// Hold task creation until released.
        #[arg(long)]
        debug_build: bool,

        /// Hold each task after its claim until released.
        #[arg(long)]
        debug_run: bool,
    },

    /// Show a flow and its tasks.
    Show {
        /// Flow id or code.
        flow: String,
    },

    /// List the most recent flows of an owner.
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        owner: i64,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Request cancellation of a flow, its tasks and dependent flows.
    Cancel { flow: String },

    /// Stop new task claims for a flow.
    Pause { flow: String },

    /// Allow claims again for a paused flow.
    Resume { flow: String },

    /// Clear the debug flags so held builds and tasks continue.
    Release { flow: String },

    /// Start a fresh copy of a finished flow.
    Resubmit { flow: String },
}

pub async fn handle_flow_command(cmd: FlowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        FlowCommand::Submit {
            flow_type,
            owner,
            param1,
            description,
            subject,
            parent,
            after,
            priority,
            start_at,
            debug_build,
            debug_run,
        } => {
            let mut request = FlowRequest::new(OwnerId(owner), flow_type)
                .debug_build(debug_build)
                .debug_run(debug_run);
            if let Some(p) = param1 {
                request = request.param1(p);
            }
            if let Some(d) = description {
                request = request.description(d);
            }
            if let Some(code) = subject {
                request = request.subject(code);
            }
            if let Some(id) = parent {
                request = request.parent(FlowId(id));
            }
            if let Some(id) = after {
                request = request.after_flow(FlowId(id));
            }
            if let Some(level) = priority {
                request = request.priority(level);
            }
            if let Some(at) = start_at {
                request = request.start_after(at);
            }
            let flow = state.builder().create_flow(&request).await?;
            if json {
                return render::json(&flow);
            }
            render::done(format!("Submitted flow {} ({})", style(flow.id).cyan(), flow.code));
            Ok(())
        }
        FlowCommand::Show { flow } => handle_show(&flow, state, json).await,
        FlowCommand::List { owner, limit } => {
            let flows = state.store.list_flows_by_owner(OwnerId(owner), limit).await?;
            if json {
                return render::json(&flows);
            }
            if flows.is_empty() {
                println!();
                println!("  No flows for owner {owner}.");
                println!(
                    "  Submit one with: {}",
                    style(format!("dynaflow flow submit <type> --owner {owner}")).dim()
                );
                println!();
                return Ok(());
            }
            println!("{}", render::flows_table(&state.catalog, &flows));
            Ok(())
        }
        FlowCommand::Cancel { flow } => {
            let flow = resolve_flow(state, &flow).await?;
            let report = state.propagator().request_cancel(flow.id).await?;
            if json {
                return render::json(&serde_json::json!({
                    "flow_id": flow.id,
                    "flows_visited": report.flows_visited,
                    "flows_requested": report.flows_requested,
                    "tasks_canceled": report.tasks_canceled,
                }));
            }
            if report.flows_visited == 0 {
                render::done(format!("Flow {} has already finished", flow.id));
            } else {
                render::done(format!(
                    "Canceled flow {}: {} flow(s) visited, {} task(s) canceled",
                    style(flow.id).cyan(),
                    report.flows_visited,
                    report.tasks_canceled
                ));
            }
            Ok(())
        }
        FlowCommand::Pause { flow } => {
            let flow = resolve_flow(state, &flow).await?;
            let flow = state.propagator().pause(flow.id).await?;
            print_flow_change(&flow, "Paused", json)
        }
        FlowCommand::Resume { flow } => {
            let flow = resolve_flow(state, &flow).await?;
            let flow = state.propagator().resume(flow.id).await?;
            print_flow_change(&flow, "Resumed", json)
        }
        FlowCommand::Release { flow } => {
            let flow = resolve_flow(state, &flow).await?;
            let released = update_flow_with(
                state.store.as_ref(),
                flow.id,
                state.config.conflict_retry_limit,
                |f| {
                    if !f.is_build_task_debug_required && !f.is_run_task_debug_required {
                        return Ok(false);
                    }
                    f.is_build_task_debug_required = false;
                    f.is_run_task_debug_required = false;
                    Ok(true)
                },
            )
            .await?;
            print_flow_change(&released.into_inner(), "Released", json)
        }
        FlowCommand::Resubmit { flow } => {
            let flow = resolve_flow(state, &flow).await?;
            let fresh = state.builder().resubmit_flow(flow.id).await?;
            if json {
                return render::json(&fresh);
            }
            render::done(format!(
                "Resubmitted flow {} as {}",
                flow.id,
                style(fresh.id).cyan()
            ));
            Ok(())
        }
    }
}

async fn handle_show(target: &str, state: &AppState, json: bool) -> Result<()> {
    let flow = resolve_flow(state, target).await?;
    let tasks = state.store.list_tasks_by_flow(flow.id).await?;

    if json {
        return render::json(&serde_json::json!({ "flow": flow, "tasks": tasks }));
    }

    let type_name = state
        .catalog
        .flow_type_by_id(flow.type_id)
        .map(|t| t.name)
        .unwrap_or_else(|| flow.type_id.to_string());
    println!();
    println!(
        "  {} Flow {} ({})",
        style("*").bold(),
        style(flow.id).cyan(),
        type_name
    );
    println!("  Code:      {}", flow.code);
    println!("  Owner:     {}", flow.owner_id);
    println!("  Status:    {}", flow.status());
    println!("  Priority:  {}", flow.priority_level);
    if let Some(parent) = flow.parent_flow_id {
        println!("  Parent:    {parent} (root {})", flow.root_flow_id);
    }
    if let Some(dep) = flow.dependency_flow_id {
        println!("  After:     {dep}");
    }
    if flow.is_build_task_debug_required || flow.is_run_task_debug_required {
        println!(
            "  Debug:     {}",
            style("held until `dynaflow flow release`").yellow()
        );
    }
    if let Some(result) = &flow.result_value {
        println!("  Result:    {result}");
    }
    println!();
    if tasks.is_empty() {
        println!("  No tasks yet.");
        println!();
    } else {
        println!("{}", render::tasks_table(&state.catalog, &tasks));
    }
    Ok(())
}

fn print_flow_change(flow: &Flow, verb: &str, json: bool) -> Result<()> {
    if json {
        return render::json(flow);
    }
    render::done(format!("{verb} flow {} (status {})", style(flow.id).cyan(), flow.status()));
    Ok(())
}

/// Look a flow up by numeric id or UUID code.
async fn resolve_flow(state: &AppState, target: &str) -> Result<Flow> {
    let flow = if let Ok(code) = target.parse::<Uuid>() {
        state.store.get_flow_by_code(&code).await?
    } else {
        let id: FlowId = target
            .parse()
            .with_context(|| format!("'{target}' is neither a flow id nor a flow code"))?;
        state.store.get_flow(id).await?
    };
    match flow {
        Some(flow) => Ok(flow),
        None => bail!("Flow '{target}' not found"),
    }
}
