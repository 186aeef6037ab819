//! CLI schedule subcommands: add and list.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use console::style;

use dynaflow_core::repository::FlowStore;
use dynaflow_types::ids::OwnerId;
use dynaflow_types::schedule::MAX_FREQUENCY_IN_HOURS;

use super::render;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum ScheduleCommand {
    /// Create a flow of a type every N hours.
    Add {
        /// Flow type lookup name.
        flow_type: String,

        #[arg(long)]
        owner: i64,

        /// Hours between runs.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_FREQUENCY_IN_HOURS)))]
        every: u32,

        /// First run (RFC 3339). Defaults to now.
        #[arg(long)]
        first_run_at: Option<DateTime<Utc>>,

        /// Payload copied into every created flow.
        #[arg(long)]
        param1: Option<String>,
    },

    /// List schedules.
    #[command(alias = "ls")]
    List {
        /// Only schedules of this owner.
        #[arg(long)]
        owner: Option<i64>,
    },
}

pub async fn handle_schedule_command(cmd: ScheduleCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ScheduleCommand::Add {
            flow_type,
            owner,
            every,
            first_run_at,
            param1,
        } => {
            let schedule = state
                .trigger()
                .add_schedule(OwnerId(owner), &flow_type, every, first_run_at, param1)
                .await?;
            if json {
                return render::json(&schedule);
            }
            render::done(format!(
                "Schedule {} creates '{}' every {}h, next at {}",
                style(schedule.id).cyan(),
                flow_type,
                schedule.frequency_in_hours,
                schedule.next_run_at.format("%Y-%m-%d %H:%M")
            ));
            Ok(())
        }
        ScheduleCommand::List { owner } => {
            let schedules = state.store.list_schedules(owner.map(OwnerId)).await?;
            if json {
                return render::json(&schedules);
            }
            if schedules.is_empty() {
                println!();
                println!("  No schedules.");
                println!(
                    "  Add one with: {}",
                    style("dynaflow schedule add <type> --owner <id> --every <hours>").dim()
                );
                println!();
                return Ok(());
            }
            println!("{}", render::schedules_table(&state.catalog, &schedules));
            Ok(())
        }
    }
}
