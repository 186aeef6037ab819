//! Task execution and finalisation.
//!
//! Runs the handler for a leased task while a watcher re-reads the task and
//! its flow at a fixed interval. Cancellation observed by the watcher fires the
//! handler's token; the handler decides when to stop. The attempt's outcome is
//! written with a version-checked update against freshly read state, so a
//! cancellation that landed mid-run is never overwritten.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dynaflow_types::config::EngineConfig;
use dynaflow_types::event::EngineEvent;
use dynaflow_types::task::Task;
use futures_util::FutureExt;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EngineError;
use super::catalog::CatalogCache;
use super::completion::refresh_flow;
use super::debug_gate::{DebugGate, GateKey};
use super::handler::{BoxTaskHandler, HandlerRegistry, TaskContext, TaskError};
use super::retry::{RetryDecision, RetryPolicy};
use super::versioned::update_task_with;
use crate::event::EventBus;
use crate::repository::FlowStore;

/// How an execution ended, as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    RetryScheduled {
        retry_count: u32,
        min_start_at: DateTime<Utc>,
    },
    Failed,
    Canceled,
    /// Someone else finalised or re-leased the task; nothing was written.
    LeaseLost,
}

pub struct TaskExecutor<S> {
    store: Arc<S>,
    catalog: Arc<CatalogCache>,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
    gate: Arc<DebugGate>,
    retry: RetryPolicy,
    processor_identifier: String,
    cancel_watch_interval: Duration,
    conflict_retry_limit: u32,
}

impl<S: FlowStore> TaskExecutor<S> {
    pub fn new(
        store: Arc<S>,
        catalog: Arc<CatalogCache>,
        handlers: Arc<HandlerRegistry>,
        events: EventBus,
        gate: Arc<DebugGate>,
        config: &EngineConfig,
        processor_identifier: impl Into<String>,
    ) -> Self {
        Self {
            store,
            catalog,
            handlers,
            events,
            gate,
            retry: RetryPolicy::from_config(config),
            processor_identifier: processor_identifier.into(),
            cancel_watch_interval: Duration::from_millis(config.cancel_watch_interval_ms.max(1)),
            conflict_retry_limit: config.conflict_retry_limit,
        }
    }

    /// Run a task leased by this processor and record the outcome.
    pub async fn execute(&self, task: Task) -> Result<ExecutionOutcome, EngineError> {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let mut watch = tokio::time::interval(self.cancel_watch_interval);
        watch.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let flow = self
            .store
            .get_flow(task.flow_id)
            .await?
            .ok_or(EngineError::FlowNotFound(task.flow_id))?;

        if flow.is_run_task_debug_required {
            self.hold_for_debug(&task, &cancel, &mut watch).await;
        }

        let attempt = if cancel.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            match self.handler_for(&task) {
                Some(handler) => self.run_handler(&task, &handler, &cancel, &mut watch).await,
                None => Err(TaskError::Failed(format!(
                    "no handler registered for task type {}",
                    task.type_id
                ))),
            }
        };

        self.finalize(&task, attempt, started.elapsed()).await
    }

    async fn hold_for_debug(&self, task: &Task, cancel: &CancellationToken, watch: &mut Interval) {
        let key = GateKey::Task(task.id);
        self.gate.hold(key);
        info!(task_id = %task.id, flow_id = %task.flow_id, "task held for debugging");

        let wait = self.gate.wait(key, cancel);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                outcome = &mut wait => {
                    debug!(task_id = %task.id, ?outcome, "debug hold ended");
                    break;
                }
                _ = watch.tick() => self.watch(task, cancel, Some(key)).await,
            }
        }
    }

    async fn run_handler(
        &self,
        task: &Task,
        handler: &BoxTaskHandler,
        cancel: &CancellationToken,
        watch: &mut Interval,
    ) -> Result<String, TaskError> {
        let ctx = TaskContext {
            task_id: task.id,
            task_code: task.code,
            flow_id: task.flow_id,
            subject_code: task.flow_subject_code,
            param1: task.param1.clone(),
            param2: task.param2.clone(),
            retry_count: task.retry_count,
            cancel: cancel.clone(),
        };
        // A panicking handler fails the task instead of leaving it leased.
        let run = AssertUnwindSafe(async move { handler.run(ctx).await })
            .catch_unwind()
            .map(|result| {
                result.unwrap_or_else(|panic| {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(task_id = %task.id, panic = %message, "task handler panicked");
                    Err(TaskError::Failed(format!("task handler panicked: {message}")))
                })
            });
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = watch.tick() => self.watch(task, cancel, None).await,
            }
        }
    }

    /// Re-read task and flow; fire `cancel` when either is being canceled and
    /// release the debug hold once the flow no longer asks for it.
    async fn watch(&self, task: &Task, cancel: &CancellationToken, gate_key: Option<GateKey>) {
        if cancel.is_cancelled() {
            return;
        }
        match self.store.get_task(task.id).await {
            Ok(Some(current)) if current.is_cancel_requested || !current.is_running() => {
                debug!(task_id = %task.id, "task cancellation observed");
                cancel.cancel();
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                cancel.cancel();
                return;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "cancel watch read failed");
                return;
            }
        }
        match self.store.get_flow(task.flow_id).await {
            Ok(Some(flow)) => {
                if flow.is_cancel_requested || flow.is_terminal() {
                    debug!(task_id = %task.id, flow_id = %flow.id, "flow cancellation observed");
                    cancel.cancel();
                } else if let Some(key) = gate_key {
                    if !flow.is_run_task_debug_required {
                        self.gate.release(key);
                    }
                }
            }
            Ok(None) => cancel.cancel(),
            Err(e) => warn!(flow_id = %task.flow_id, error = %e, "cancel watch read failed"),
        }
    }

    fn handler_for(&self, task: &Task) -> Option<Arc<BoxTaskHandler>> {
        let task_type = self.catalog.task_type_by_id(task.type_id)?;
        self.handlers.get(&task_type.lookup_enum_name)
    }

    async fn finalize(
        &self,
        task: &Task,
        attempt: Result<String, TaskError>,
        elapsed: Duration,
    ) -> Result<ExecutionOutcome, EngineError> {
        let now = Utc::now();
        let me = self.processor_identifier.as_str();
        let retry = self.retry;
        let mut outcome = ExecutionOutcome::LeaseLost;

        let mutation = update_task_with(self.store.as_ref(), task.id, self.conflict_retry_limit, |t| {
            if t.is_terminal() {
                outcome = if t.is_canceled {
                    ExecutionOutcome::Canceled
                } else {
                    ExecutionOutcome::LeaseLost
                };
                return Ok(false);
            }
            if !t.is_started || t.processor_identifier.as_deref() != Some(me) {
                outcome = ExecutionOutcome::LeaseLost;
                return Ok(false);
            }
            match &attempt {
                Ok(value) => {
                    t.is_completed = true;
                    t.is_successful = true;
                    t.completed_at = Some(now);
                    t.result_value = Some(value.clone());
                    outcome = ExecutionOutcome::Succeeded;
                }
                Err(TaskError::Cancelled) => {
                    t.mark_canceled(now);
                    t.result_value = Some("canceled".to_string());
                    outcome = ExecutionOutcome::Canceled;
                }
                Err(TaskError::Failed(error)) => {
                    t.result_value = Some(error.clone());
                    match retry.decide(t, now) {
                        RetryDecision::Retry {
                            retry_count,
                            min_start_at,
                        } => {
                            t.retry_count = retry_count;
                            t.is_started = false;
                            t.started_at = None;
                            t.min_start_at = min_start_at;
                            outcome = ExecutionOutcome::RetryScheduled {
                                retry_count,
                                min_start_at,
                            };
                        }
                        RetryDecision::Exhausted => {
                            t.is_completed = true;
                            t.is_successful = false;
                            t.completed_at = Some(now);
                            outcome = ExecutionOutcome::Failed;
                        }
                    }
                }
            }
            Ok(true)
        })
        .await?;

        let (task_id, flow_id) = (task.id, task.flow_id);
        if mutation.is_applied() {
            match (&outcome, &attempt) {
                (ExecutionOutcome::Succeeded, _) => {
                    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                    info!(task_id = %task_id, flow_id = %flow_id, duration_ms, "task succeeded");
                    self.events.publish(EngineEvent::TaskSucceeded {
                        task_id,
                        flow_id,
                        duration_ms,
                    });
                }
                (ExecutionOutcome::RetryScheduled { retry_count, min_start_at }, Err(error)) => {
                    info!(
                        task_id = %task_id,
                        flow_id = %flow_id,
                        retry_count,
                        min_start_at = %min_start_at,
                        error = %error,
                        "task attempt failed, retry scheduled"
                    );
                    self.events.publish(EngineEvent::TaskRetryScheduled {
                        task_id,
                        flow_id,
                        retry_count: *retry_count,
                        error: error.to_string(),
                    });
                }
                (ExecutionOutcome::Failed, Err(error)) => {
                    warn!(task_id = %task_id, flow_id = %flow_id, error = %error, "task failed, retries exhausted");
                    self.events.publish(EngineEvent::TaskFailed {
                        task_id,
                        flow_id,
                        error: error.to_string(),
                    });
                }
                (ExecutionOutcome::Canceled, _) => {
                    info!(task_id = %task_id, flow_id = %flow_id, "task canceled during execution");
                    self.events.publish(EngineEvent::TaskCanceled { task_id, flow_id });
                }
                _ => {}
            }
        } else {
            debug!(task_id = %task_id, ?outcome, "task already finalised elsewhere, result dropped");
        }

        if !matches!(outcome, ExecutionOutcome::RetryScheduled { .. } | ExecutionOutcome::LeaseLost) {
            refresh_flow(self.store.as_ref(), &self.events, flow_id, self.conflict_retry_limit).await?;
        }
        Ok(outcome)
    }
}
