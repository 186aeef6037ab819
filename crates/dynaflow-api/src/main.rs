//! DynaFlow CLI entry point.
//!
//! Binary name: `dynaflow`
//!
//! Parses CLI arguments, initializes tracing, the database and the catalog,
//! then dispatches to the command handler.

mod builtin;
mod cli;
mod state;

use clap::Parser;
use dynaflow_observe::{ObserveConfig, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let observe = ObserveConfig {
        json: cli.log_json,
        otel: cli.otel,
        ..ObserveConfig::default()
    }
    .with_verbosity(cli.verbose, cli.quiet);
    if let Err(e) = init_tracing(&observe) {
        eprintln!("Warning: tracing setup failed: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init(cli.database_url.as_deref()).await?;
    tracing::debug!(data_dir = %state.data_dir.display(), "state initialized");

    match cli.command {
        Commands::Run { once, owner } => cli::run::handle_run(&state, once, owner, cli.json).await,
        Commands::Trigger { owner } => cli::run::handle_trigger(&state, owner, cli.json).await,
        Commands::Flow { action } => cli::flow::handle_flow_command(action, &state, cli.json).await,
        Commands::Schedule { action } => {
            cli::schedule::handle_schedule_command(action, &state, cli.json).await
        }
        Commands::Catalog { action } => {
            cli::catalog::handle_catalog_command(action, &state, cli.json).await
        }
    }
}
