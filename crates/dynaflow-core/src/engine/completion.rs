//! Flow lifecycle roll-up from task states.
//!
//! Called after any task changes state. A flow is started once any of its
//! tasks started. Once task creation is closed and every task is terminal the
//! flow completes, successful only if every task succeeded. A cancel-requested
//! flow whose tasks are all terminal becomes canceled instead.

use chrono::{DateTime, Utc};
use dynaflow_types::event::EngineEvent;
use dynaflow_types::flow::Flow;
use dynaflow_types::ids::FlowId;
use dynaflow_types::task::Task;
use tracing::{debug, info};

use super::EngineError;
use crate::event::EventBus;
use crate::repository::{FlowStore, VersionedUpdate};

/// What a roll-up changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollUp {
    Unchanged,
    Started,
    Completed { is_successful: bool },
    Canceled,
}

/// Bring flow `flow_id` in line with its tasks.
pub async fn refresh_flow<S: FlowStore>(
    store: &S,
    events: &EventBus,
    flow_id: FlowId,
    conflict_retry_limit: u32,
) -> Result<RollUp, EngineError> {
    let attempts = conflict_retry_limit.max(1);
    for attempt in 1..=attempts {
        let flow = store
            .get_flow(flow_id)
            .await?
            .ok_or(EngineError::FlowNotFound(flow_id))?;
        if flow.is_terminal() {
            return Ok(RollUp::Unchanged);
        }
        let tasks = store.list_tasks_by_flow(flow_id).await?;

        let mut next = flow.clone();
        let outcome = roll_up(&mut next, &tasks, Utc::now());
        if outcome == RollUp::Unchanged {
            return Ok(outcome);
        }

        match store.update_flow(&next, flow.last_change_code).await? {
            VersionedUpdate::Applied(_) => {
                match outcome {
                    RollUp::Completed { is_successful } => {
                        info!(flow_id = %flow_id, is_successful, "flow completed");
                        events.publish(EngineEvent::FlowCompleted { flow_id, is_successful });
                    }
                    RollUp::Canceled => {
                        info!(flow_id = %flow_id, "flow canceled");
                        events.publish(EngineEvent::FlowCanceled { flow_id });
                    }
                    RollUp::Started => debug!(flow_id = %flow_id, "flow started"),
                    RollUp::Unchanged => {}
                }
                return Ok(outcome);
            }
            VersionedUpdate::Stale => {
                debug!(flow_id = %flow_id, attempt, "flow changed during roll-up, re-reading");
            }
        }
    }
    Err(EngineError::ConflictRetriesExhausted {
        entity: format!("flow {flow_id}"),
        attempts,
    })
}

/// Apply the roll-up rules to `flow` in place.
fn roll_up(flow: &mut Flow, tasks: &[Task], now: DateTime<Utc>) -> RollUp {
    let all_terminal = tasks.iter().all(Task::is_terminal);

    // Nothing is being built and nothing is running.
    let creation_idle = flow.is_tasks_created || !flow.is_task_creation_started;
    if flow.is_cancel_requested && all_terminal && creation_idle {
        flow.result_value = Some("canceled".to_string());
        flow.mark_canceled(now);
        return RollUp::Canceled;
    }

    if flow.is_tasks_created && all_terminal {
        let is_successful = tasks.iter().all(Task::is_succeeded);
        flow.is_started = true;
        flow.started_at = flow.started_at.or_else(|| first_start(tasks)).or(Some(now));
        flow.is_completed = true;
        flow.is_successful = is_successful;
        flow.completed_at = Some(now);
        flow.result_value = if is_successful {
            tasks
                .iter()
                .filter(|t| t.is_succeeded())
                .max_by_key(|t| (t.completed_at, t.id))
                .and_then(|t| t.result_value.clone())
        } else {
            tasks
                .iter()
                .filter(|t| !t.is_succeeded())
                .min_by_key(|t| (t.completed_at, t.id))
                .map(|t| {
                    t.result_value
                        .clone()
                        .unwrap_or_else(|| format!("task {} did not succeed", t.id))
                })
        };
        return RollUp::Completed { is_successful };
    }

    if !flow.is_started && tasks.iter().any(|t| t.is_started) {
        flow.is_started = true;
        flow.started_at = first_start(tasks).or(Some(now));
        return RollUp::Started;
    }

    RollUp::Unchanged
}

fn first_start(tasks: &[Task]) -> Option<DateTime<Utc>> {
    tasks.iter().filter_map(|t| t.started_at).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryFlowStore;
    use crate::repository::memory::tests::{new_flow, new_task};

    async fn setup(task_count: usize) -> (InMemoryFlowStore, Flow, Vec<Task>) {
        let store = InMemoryFlowStore::new();
        let flow = store.create_flow(&new_flow(1, 5)).await.unwrap();
        let mut tasks = Vec::new();
        for _ in 0..task_count {
            tasks.push(store.create_task(&new_task(&flow, 1)).await.unwrap());
        }
        let mut sealed = flow.clone();
        sealed.is_tasks_created = true;
        store.update_flow(&sealed, flow.last_change_code).await.unwrap();
        (store, flow, tasks)
    }

    async fn set_task(store: &InMemoryFlowStore, task: &Task, f: impl FnOnce(&mut Task)) {
        let current = store.get_task(task.id).await.unwrap().unwrap();
        let mut next = current.clone();
        f(&mut next);
        store.update_task(&next, current.last_change_code).await.unwrap();
    }

    fn succeed(t: &mut Task) {
        t.is_started = true;
        t.started_at = Some(Utc::now());
        t.is_completed = true;
        t.is_successful = true;
        t.completed_at = Some(Utc::now());
        t.result_value = Some(format!("done {}", t.id));
    }

    #[tokio::test]
    async fn first_claim_starts_flow() {
        let (store, flow, tasks) = setup(2).await;
        let bus = EventBus::new(8);
        set_task(&store, &tasks[0], |t| {
            t.is_started = true;
            t.started_at = Some(Utc::now());
        })
        .await;

        assert_eq!(refresh_flow(&store, &bus, flow.id, 3).await.unwrap(), RollUp::Started);
        assert_eq!(refresh_flow(&store, &bus, flow.id, 3).await.unwrap(), RollUp::Unchanged);
        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(stored.is_started && stored.started_at.is_some());
    }

    #[tokio::test]
    async fn all_succeeded_completes_successfully() {
        let (store, flow, tasks) = setup(2).await;
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        set_task(&store, &tasks[0], succeed).await;
        assert_eq!(refresh_flow(&store, &bus, flow.id, 3).await.unwrap(), RollUp::Started);

        set_task(&store, &tasks[1], succeed).await;
        assert_eq!(
            refresh_flow(&store, &bus, flow.id, 3).await.unwrap(),
            RollUp::Completed { is_successful: true }
        );
        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(stored.is_completed && stored.is_successful && stored.is_started);
        assert_eq!(stored.result_value, Some(format!("done {}", tasks[1].id)));
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::FlowCompleted { flow_id: flow.id, is_successful: true }
        );
    }

    #[tokio::test]
    async fn failed_task_fails_flow_with_its_error() {
        let (store, flow, tasks) = setup(2).await;
        let bus = EventBus::new(8);
        set_task(&store, &tasks[0], succeed).await;
        set_task(&store, &tasks[1], |t| {
            t.is_started = true;
            t.is_completed = true;
            t.completed_at = Some(Utc::now());
            t.result_value = Some("disk full".into());
        })
        .await;

        assert_eq!(
            refresh_flow(&store, &bus, flow.id, 3).await.unwrap(),
            RollUp::Completed { is_successful: false }
        );
        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(!stored.is_successful);
        assert_eq!(stored.result_value.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn open_task_creation_keeps_flow_running() {
        let store = InMemoryFlowStore::new();
        let bus = EventBus::new(8);
        let flow = store.create_flow(&new_flow(1, 5)).await.unwrap();
        let task = store.create_task(&new_task(&flow, 1)).await.unwrap();
        set_task(&store, &task, succeed).await;

        assert_eq!(refresh_flow(&store, &bus, flow.id, 3).await.unwrap(), RollUp::Started);
        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(!stored.is_completed);
    }

    #[tokio::test]
    async fn cancel_requested_flow_is_canceled_once_tasks_are_terminal() {
        let (store, flow, tasks) = setup(1).await;
        let bus = EventBus::new(8);
        let current = store.get_flow(flow.id).await.unwrap().unwrap();
        let mut requested = current.clone();
        requested.is_cancel_requested = true;
        store.update_flow(&requested, current.last_change_code).await.unwrap();

        assert_eq!(refresh_flow(&store, &bus, flow.id, 3).await.unwrap(), RollUp::Unchanged);

        set_task(&store, &tasks[0], |t| t.mark_canceled(Utc::now())).await;
        assert_eq!(refresh_flow(&store, &bus, flow.id, 3).await.unwrap(), RollUp::Canceled);
        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(stored.is_canceled && !stored.is_successful && !stored.is_completed);
    }
}
