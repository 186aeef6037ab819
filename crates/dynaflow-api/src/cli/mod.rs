//! CLI command definitions for the `dynaflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! resource (e.g., `dynaflow flow submit`, `dynaflow schedule list`).

pub mod catalog;
pub mod flow;
pub mod render;
pub mod run;
pub mod schedule;

use clap::{Parser, Subcommand};

/// Run and manage DynaFlow processors, flows and schedules.
#[derive(Parser)]
#[command(name = "dynaflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Only log warnings and errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Database URL (defaults to `dynaflow.db` in the data directory).
    #[arg(long, global = true, env = "DYNAFLOW_DATABASE_URL")]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a processor: build, claim and execute tasks until Ctrl-C.
    Run {
        /// Process everything currently runnable, then exit.
        #[arg(long)]
        once: bool,

        /// Only serve flows of this owner.
        #[arg(long)]
        owner: Option<i64>,
    },

    /// Fire due schedules once and exit.
    Trigger {
        /// Only fire schedules of this owner.
        #[arg(long)]
        owner: Option<i64>,
    },

    /// Submit, inspect and control flows.
    Flow {
        #[command(subcommand)]
        action: flow::FlowCommand,
    },

    /// Manage recurring flow schedules.
    Schedule {
        #[command(subcommand)]
        action: schedule::ScheduleCommand,
    },

    /// Manage the flow and task type catalog.
    Catalog {
        #[command(subcommand)]
        action: catalog::CatalogCommand,
    },
}
