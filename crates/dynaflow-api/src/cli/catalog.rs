//! CLI catalog subcommands: seed the built-in types and list the catalog.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};

use dynaflow_core::repository::FlowStore;
use dynaflow_types::ids::OwnerId;

use super::render;
use crate::builtin;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum CatalogCommand {
    /// Upsert the built-in flow types (echo, fail, pipeline) and task types (echo, fail).
    Seed {
        /// Owning pac id written on the catalog rows.
        #[arg(long, default_value = "1")]
        pac: i64,
    },

    /// List flow and task types.
    #[command(alias = "ls")]
    List,
}

pub async fn handle_catalog_command(cmd: CatalogCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        CatalogCommand::Seed { pac } => {
            let (flow_types, task_types) = builtin::seed_catalog(state.store.as_ref(), OwnerId(pac)).await?;
            state.catalog.refresh(state.store.as_ref()).await?;
            if json {
                return render::json(&serde_json::json!({
                    "flow_types": flow_types,
                    "task_types": task_types,
                }));
            }
            render::done(format!(
                "Seeded {} flow type(s) and {} task type(s)",
                flow_types.len(),
                task_types.len()
            ));
            Ok(())
        }
        CatalogCommand::List => {
            let flow_types = state.store.list_flow_types().await?;
            let task_types = state.store.list_task_types().await?;
            if json {
                return render::json(&serde_json::json!({
                    "flow_types": flow_types,
                    "task_types": task_types,
                }));
            }

            let mut flows = Table::new();
            flows
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Flow type").fg(Color::Cyan),
                    Cell::new("Name"),
                    Cell::new("Priority"),
                    Cell::new("Active"),
                    Cell::new("Description"),
                ]);
            for t in &flow_types {
                flows.add_row(vec![
                    Cell::new(&t.lookup_enum_name),
                    Cell::new(&t.name),
                    Cell::new(t.priority_level),
                    Cell::new(if t.is_active { "yes" } else { "no" }),
                    Cell::new(&t.description),
                ]);
            }

            let mut tasks = Table::new();
            tasks
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Task type").fg(Color::Cyan),
                    Cell::new("Name"),
                    Cell::new("Max retries"),
                    Cell::new("Parallel"),
                    Cell::new("Active"),
                ]);
            for t in &task_types {
                tasks.add_row(vec![
                    Cell::new(&t.lookup_enum_name),
                    Cell::new(&t.name),
                    Cell::new(t.max_retry_count),
                    Cell::new(if t.is_parallel_run_allowed { "yes" } else { "no" }),
                    Cell::new(if t.is_active { "yes" } else { "no" }),
                ]);
            }

            println!("{flows}");
            println!("{tasks}");
            Ok(())
        }
    }
}
