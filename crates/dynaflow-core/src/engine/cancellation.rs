//! Cancellation and pause propagation.
//!
//! Canceling a flow cancels every task of it that has not finished and requests
//! cancellation of every flow that names it as parent or dependency, down the
//! whole tree. Running tasks are marked here; their executors observe the mark
//! and stop their handlers. Pause only stops new claims and resumes cleanly.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dynaflow_types::event::EngineEvent;
use dynaflow_types::flow::Flow;
use dynaflow_types::ids::{FlowId, OwnerId};
use tracing::{debug, info, warn};

use super::EngineError;
use super::completion::refresh_flow;
use super::versioned::{update_flow_with, update_task_with};
use crate::event::EventBus;
use crate::repository::FlowStore;

/// What one propagation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
    pub flows_visited: usize,
    /// Dependent flows newly marked cancel-requested.
    pub flows_requested: usize,
    pub tasks_canceled: usize,
}

impl CancelReport {
    fn absorb(&mut self, other: CancelReport) {
        self.flows_visited += other.flows_visited;
        self.flows_requested += other.flows_requested;
        self.tasks_canceled += other.tasks_canceled;
    }
}

pub struct CancellationPropagator<S> {
    store: Arc<S>,
    events: EventBus,
    conflict_retry_limit: u32,
}

impl<S: FlowStore> CancellationPropagator<S> {
    pub fn new(store: Arc<S>, events: EventBus, conflict_retry_limit: u32) -> Self {
        Self {
            store,
            events,
            conflict_retry_limit,
        }
    }

    /// Mark `flow_id` cancel-requested and propagate. No-op for finished flows.
    pub async fn request_cancel(&self, flow_id: FlowId) -> Result<CancelReport, EngineError> {
        let mutation = update_flow_with(self.store.as_ref(), flow_id, self.conflict_retry_limit, |f| {
            if f.is_terminal() || f.is_cancel_requested {
                return Ok(false);
            }
            f.is_cancel_requested = true;
            Ok(true)
        })
        .await?;
        if mutation.is_applied() {
            info!(flow_id = %flow_id, "flow cancellation requested");
        }
        if mutation.into_inner().is_terminal() {
            return Ok(CancelReport::default());
        }
        self.propagate(flow_id).await
    }

    /// Cancel the unfinished tasks of `flow_id` and of every flow below it.
    ///
    /// Walks the dependent-flow graph iteratively; each flow is visited once
    /// even when it is reachable both as child and as dependent.
    pub async fn propagate(&self, flow_id: FlowId) -> Result<CancelReport, EngineError> {
        let mut report = CancelReport::default();
        let mut visited: HashSet<FlowId> = HashSet::new();
        let mut pending = vec![flow_id];

        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            report.flows_visited += 1;

            let now = Utc::now();
            for task in self.store.list_tasks_by_flow(id).await? {
                if task.is_terminal() {
                    continue;
                }
                let mutation = update_task_with(self.store.as_ref(), task.id, self.conflict_retry_limit, |t| {
                    if t.is_terminal() {
                        return Ok(false);
                    }
                    t.mark_canceled(now);
                    t.result_value = Some("canceled".to_string());
                    Ok(true)
                })
                .await?;
                if mutation.is_applied() {
                    report.tasks_canceled += 1;
                    debug!(task_id = %task.id, flow_id = %id, was_running = task.is_started, "task canceled");
                    self.events.publish(EngineEvent::TaskCanceled {
                        task_id: task.id,
                        flow_id: id,
                    });
                }
            }

            for dependent in self.store.list_dependent_flows(id).await? {
                if dependent.is_terminal() || visited.contains(&dependent.id) {
                    continue;
                }
                let mutation =
                    update_flow_with(self.store.as_ref(), dependent.id, self.conflict_retry_limit, |f| {
                        if f.is_terminal() || f.is_cancel_requested {
                            return Ok(false);
                        }
                        f.is_cancel_requested = true;
                        Ok(true)
                    })
                    .await?;
                if mutation.is_applied() {
                    report.flows_requested += 1;
                    info!(flow_id = %dependent.id, cause = %id, "dependent flow cancellation requested");
                }
                pending.push(dependent.id);
            }

            refresh_flow(self.store.as_ref(), &self.events, id, self.conflict_retry_limit).await?;
        }
        Ok(report)
    }

    /// Propagate every flow left cancel-requested but not yet canceled, for
    /// example by a CLI request or a processor that died mid-propagation.
    pub async fn sweep(&self, owner_id: Option<OwnerId>, limit: u32) -> Result<CancelReport, EngineError> {
        let mut report = CancelReport::default();
        for flow in self.store.list_flows_pending_cancel(owner_id, limit).await? {
            match self.propagate(flow.id).await {
                Ok(r) => report.absorb(r),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!(flow_id = %flow.id, error = %e, "cancel propagation failed"),
            }
        }
        Ok(report)
    }

    /// Stop new claims for `flow_id`. Running tasks finish normally.
    pub async fn pause(&self, flow_id: FlowId) -> Result<Flow, EngineError> {
        self.set_paused(flow_id, true).await
    }

    pub async fn resume(&self, flow_id: FlowId) -> Result<Flow, EngineError> {
        self.set_paused(flow_id, false).await
    }

    async fn set_paused(&self, flow_id: FlowId, paused: bool) -> Result<Flow, EngineError> {
        let mutation = update_flow_with(self.store.as_ref(), flow_id, self.conflict_retry_limit, |f| {
            if f.is_paused == paused || f.is_terminal() {
                return Ok(false);
            }
            f.is_paused = paused;
            Ok(true)
        })
        .await?;
        if mutation.is_applied() {
            info!(flow_id = %flow_id, paused, "flow pause state changed");
        }
        Ok(mutation.into_inner())
    }
}
