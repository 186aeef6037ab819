//! CLI processor commands: `run` and `trigger`.

use anyhow::Result;
use chrono::Utc;
use console::style;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use dynaflow_types::ids::OwnerId;

use super::render;
use crate::state::AppState;

/// Run a processor until Ctrl-C, or once to idle with `once`.
pub async fn handle_run(state: &AppState, once: bool, owner: Option<i64>, json: bool) -> Result<()> {
    let processor = state.processor(owner.map(OwnerId));

    if json {
        // Stream engine events as JSON lines.
        let mut events = processor.events().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => tracing::warn!(error = %e, "failed to encode event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    if once {
        let executed = processor.run_until_idle().await?;
        if json {
            return render::json(&serde_json::json!({
                "processor": processor.processor_identifier(),
                "executed": executed,
            }));
        }
        render::done(format!(
            "Processor {} executed {executed} task(s)",
            style(processor.processor_identifier()).cyan()
        ));
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        signal.cancel();
    });

    if !json {
        println!();
        println!(
            "  {} Processor {} running (Ctrl-C to stop)",
            style("*").green().bold(),
            style(processor.processor_identifier()).cyan()
        );
        println!();
    }
    processor.run(shutdown).await?;
    Ok(())
}

/// Fire due schedules once.
pub async fn handle_trigger(state: &AppState, owner: Option<i64>, json: bool) -> Result<()> {
    let flows = state
        .trigger()
        .process_due_schedules(owner.map(OwnerId), Utc::now())
        .await?;
    if json {
        return render::json(&flows);
    }
    if flows.is_empty() {
        render::done("No schedules due");
    } else {
        render::done(format!("Created {} flow(s) from due schedules", flows.len()));
        println!("{}", render::flows_table(&state.catalog, &flows));
    }
    Ok(())
}
