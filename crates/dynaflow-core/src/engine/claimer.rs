//! Task claiming.
//!
//! Candidates come from the store already filtered and ordered by flow
//! priority. Each one is checked against its dependencies and then leased with
//! a version-checked update, so when several processors race for the same task
//! exactly one of them wins and the rest move on.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dynaflow_types::config::EngineConfig;
use dynaflow_types::event::EngineEvent;
use dynaflow_types::ids::{FlowId, OwnerId, TaskId, TaskTypeId};
use dynaflow_types::task::Task;
use tracing::{debug, info, warn};

use super::EngineError;
use super::completion::refresh_flow;
use super::resolver::{DependencyResolver, Eligibility};
use super::versioned::update_task_with;
use crate::event::EventBus;
use crate::repository::{CandidateQuery, CandidateTask, FlowStore, VersionedUpdate};

pub struct TaskClaimer<S> {
    store: Arc<S>,
    events: EventBus,
    processor_identifier: String,
    owner_id: Option<OwnerId>,
    batch_size: u32,
    conflict_retry_limit: u32,
}

impl<S: FlowStore> TaskClaimer<S> {
    pub fn new(
        store: Arc<S>,
        events: EventBus,
        config: &EngineConfig,
        processor_identifier: impl Into<String>,
    ) -> Self {
        Self {
            store,
            events,
            processor_identifier: processor_identifier.into(),
            owner_id: config.owner_id,
            batch_size: config.batch_size.max(1),
            conflict_retry_limit: config.conflict_retry_limit,
        }
    }

    pub fn processor_identifier(&self) -> &str {
        &self.processor_identifier
    }

    /// Lease up to `capacity` ready tasks, highest priority first.
    ///
    /// `task_type_ids` limits claiming to the task types this processor can
    /// run. Candidates whose predecessors failed are canceled on the way.
    /// Once something has been leased, later errors end the batch early
    /// instead of failing it, so no lease is dropped on the floor.
    pub async fn claim(
        &self,
        capacity: usize,
        task_type_ids: Option<Vec<TaskTypeId>>,
    ) -> Result<Vec<Task>, EngineError> {
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut candidates = self
            .store
            .list_candidate_tasks(&CandidateQuery {
                owner_id: self.owner_id,
                now,
                task_type_ids,
                limit: self.batch_size,
            })
            .await?;
        order_candidates(&mut candidates);

        let mut leased = Vec::new();
        let mut touched: BTreeSet<FlowId> = BTreeSet::new();
        for candidate in candidates {
            if leased.len() >= capacity {
                break;
            }
            let flow_id = candidate.task.flow_id;
            match self.consider(candidate.task, now).await {
                Ok(Some(task)) => {
                    touched.insert(flow_id);
                    leased.push(task);
                }
                Ok(None) => {}
                Err(e) if leased.is_empty() => return Err(e),
                Err(e) => {
                    warn!(error = %e, claimed = leased.len(), "claim batch cut short");
                    break;
                }
            }
        }

        for flow_id in touched {
            if let Err(e) = refresh_flow(self.store.as_ref(), &self.events, flow_id, self.conflict_retry_limit).await
            {
                warn!(flow_id = %flow_id, error = %e, "flow roll-up after claim failed");
            }
        }
        Ok(leased)
    }

    async fn consider(&self, task: Task, now: DateTime<Utc>) -> Result<Option<Task>, EngineError> {
        match DependencyResolver::evaluate(self.store.as_ref(), &task).await? {
            Eligibility::Ready => self.try_claim(&task, now).await,
            Eligibility::Blocked => {
                debug!(task_id = %task.id, "task waiting on dependencies");
                Ok(None)
            }
            Eligibility::Doomed { predecessor } => {
                self.cancel_doomed(&task, predecessor).await?;
                Ok(None)
            }
        }
    }

    /// Lease `task` as read. `None` when another processor changed it first or
    /// a sibling of an exclusive task type is running.
    pub async fn try_claim(&self, task: &Task, now: DateTime<Utc>) -> Result<Option<Task>, EngineError> {
        let mut lease = task.clone();
        lease.is_started = true;
        lease.started_at = Some(now);
        lease.processor_identifier = Some(self.processor_identifier.clone());

        match self.store.claim_task(&lease, task.last_change_code).await? {
            VersionedUpdate::Applied(version) => {
                lease.last_change_code = version;
                info!(
                    task_id = %lease.id,
                    flow_id = %lease.flow_id,
                    retry_count = lease.retry_count,
                    processor = %self.processor_identifier,
                    "task claimed"
                );
                self.events.publish(EngineEvent::TaskClaimed {
                    task_id: lease.id,
                    flow_id: lease.flow_id,
                    processor: self.processor_identifier.clone(),
                });
                Ok(Some(lease))
            }
            VersionedUpdate::Stale => {
                debug!(task_id = %task.id, "task claimed elsewhere or excluded, skipping");
                Ok(None)
            }
        }
    }

    async fn cancel_doomed(&self, task: &Task, predecessor: TaskId) -> Result<(), EngineError> {
        let now = Utc::now();
        let mutation = update_task_with(self.store.as_ref(), task.id, self.conflict_retry_limit, |t| {
            if t.is_started || t.is_terminal() {
                return Ok(false);
            }
            t.mark_canceled(now);
            t.result_value = Some(format!("dependency task {predecessor} did not succeed"));
            Ok(true)
        })
        .await?;

        if mutation.is_applied() {
            warn!(task_id = %task.id, predecessor = %predecessor, "task canceled, dependency did not succeed");
            self.events.publish(EngineEvent::TaskCanceled {
                task_id: task.id,
                flow_id: task.flow_id,
            });
            refresh_flow(self.store.as_ref(), &self.events, task.flow_id, self.conflict_retry_limit).await?;
        }
        Ok(())
    }
}

/// Flow priority ascending (1 is most urgent), then request time, then id.
pub fn order_candidates(candidates: &mut [CandidateTask]) {
    candidates.sort_by(|a, b| {
        a.flow_priority_level
            .cmp(&b.flow_priority_level)
            .then(a.task.requested_at.cmp(&b.task.requested_at))
            .then(a.task.id.cmp(&b.task.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::builder::{FlowBuilder, FlowRequest};
    use crate::engine::planner::{TaskPlan, TaskSpec};
    use crate::engine::testing::{OWNER, seeded};
    use crate::repository::memory::InMemoryFlowStore;

    fn claimer(store: &Arc<InMemoryFlowStore>, name: &str) -> TaskClaimer<InMemoryFlowStore> {
        TaskClaimer::new(store.clone(), EventBus::default(), &EngineConfig::default(), name)
    }

    fn single(task_type: &str) -> TaskPlan {
        TaskPlan::new().task(TaskSpec::new("only", task_type))
    }

    #[tokio::test]
    async fn higher_priority_flow_is_claimed_first() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog, 5);
        let (_, normal) = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &single("echo"), "api")
            .await
            .unwrap();
        let (_, urgent) = builder
            .submit_flow(&FlowRequest::new(OWNER, "urgent"), &single("echo"), "api")
            .await
            .unwrap();

        let leased = claimer(&store, "p1").claim(1, None).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, urgent[0].id);

        let leased = claimer(&store, "p1").claim(1, None).await.unwrap();
        assert_eq!(leased[0].id, normal[0].id);
    }

    #[tokio::test]
    async fn concurrent_claims_of_one_task_yield_one_winner() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog, 5);
        let (_, tasks) = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &single("echo"), "api")
            .await
            .unwrap();

        let a = claimer(&store, "p1");
        let b = claimer(&store, "p2");
        let now = Utc::now();
        let (won_a, won_b) = tokio::join!(a.try_claim(&tasks[0], now), b.try_claim(&tasks[0], now));
        let winners = [won_a.unwrap(), won_b.unwrap()].into_iter().flatten().count();
        assert_eq!(winners, 1);

        let stored = store.get_task(tasks[0].id).await.unwrap().unwrap();
        assert!(stored.is_started);
        assert!(matches!(stored.processor_identifier.as_deref(), Some("p1") | Some("p2")));
    }

    #[tokio::test]
    async fn concurrent_polls_never_lease_a_task_twice() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog, 5);
        for _ in 0..3 {
            builder
                .submit_flow(&FlowRequest::new(OWNER, "import"), &single("echo"), "api")
                .await
                .unwrap();
        }
        let a = claimer(&store, "p1");
        let b = claimer(&store, "p2");
        let (left, right) = tokio::join!(a.claim(10, None), b.claim(10, None));
        let mut ids: Vec<TaskId> = left.unwrap().into_iter().chain(right.unwrap()).map(|t| t.id).collect();
        ids.sort();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, 3);
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn dependent_waits_for_predecessor() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog, 5);
        let plan = TaskPlan::new()
            .task(TaskSpec::new("first", "echo"))
            .task(TaskSpec::new("second", "echo").depends_on("first"));
        let (_, tasks) = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &plan, "api")
            .await
            .unwrap();

        let claimer = claimer(&store, "p1");
        let leased = claimer.claim(5, None).await.unwrap();
        assert_eq!(leased.iter().map(|t| t.id).collect::<Vec<_>>(), vec![tasks[0].id]);

        let mut done = leased[0].clone();
        done.is_completed = true;
        done.is_successful = true;
        done.completed_at = Some(Utc::now());
        store.update_task(&done, leased[0].last_change_code).await.unwrap();

        let leased = claimer.claim(5, None).await.unwrap();
        assert_eq!(leased.iter().map(|t| t.id).collect::<Vec<_>>(), vec![tasks[1].id]);
    }

    #[tokio::test]
    async fn failed_predecessor_cancels_dependent() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog, 5);
        let plan = TaskPlan::new()
            .task(TaskSpec::new("first", "echo"))
            .task(TaskSpec::new("second", "echo").depends_on("first"));
        let (flow, tasks) = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &plan, "api")
            .await
            .unwrap();

        let claimer = claimer(&store, "p1");
        let leased = claimer.claim(5, None).await.unwrap();
        let mut failed = leased[0].clone();
        failed.is_completed = true;
        failed.is_successful = false;
        failed.completed_at = Some(Utc::now());
        store.update_task(&failed, leased[0].last_change_code).await.unwrap();

        assert!(claimer.claim(5, None).await.unwrap().is_empty());
        let dependent = store.get_task(tasks[1].id).await.unwrap().unwrap();
        assert!(dependent.is_canceled && !dependent.is_started);

        let flow = store.get_flow(flow.id).await.unwrap().unwrap();
        assert!(flow.is_completed && !flow.is_successful);
    }

    #[tokio::test]
    async fn exclusive_task_type_runs_one_at_a_time() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog, 5);
        let plan = TaskPlan::new()
            .task(TaskSpec::new("a", "exclusive"))
            .task(TaskSpec::new("b", "exclusive"));
        builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &plan, "api")
            .await
            .unwrap();

        let leased = claimer(&store, "p1").claim(5, None).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert!(claimer(&store, "p2").claim(5, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn type_filter_limits_claims() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog.clone(), 5);
        builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &single("flaky"), "api")
            .await
            .unwrap();

        let echo_only = catalog.task_type_ids_for(["echo"]);
        assert!(claimer(&store, "p1").claim(5, Some(echo_only)).await.unwrap().is_empty());
        assert_eq!(claimer(&store, "p1").claim(5, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wide_plan_with_late_predecessor_is_not_starved() {
        let (store, catalog) = seeded().await;
        let builder = FlowBuilder::new(store.clone(), catalog, 5);
        let fan_in = EngineConfig::default().batch_size as usize;
        let mut plan = TaskPlan::new();
        for i in 0..fan_in {
            plan = plan.task(TaskSpec::new(format!("d{i}"), "echo").depends_on("root"));
        }
        plan = plan.task(TaskSpec::new("root", "echo"));
        let (_, tasks) = builder
            .submit_flow(&FlowRequest::new(OWNER, "import"), &plan, "api")
            .await
            .unwrap();
        let root = tasks.last().unwrap().id;

        let claimer = claimer(&store, "p1");
        let leased = claimer.claim(4, None).await.unwrap();
        assert_eq!(leased.iter().map(|t| t.id).collect::<Vec<_>>(), vec![root]);

        let mut done = leased[0].clone();
        done.is_completed = true;
        done.is_successful = true;
        done.completed_at = Some(Utc::now());
        store.update_task(&done, leased[0].last_change_code).await.unwrap();

        let leased = claimer.claim(fan_in + 1, None).await.unwrap();
        assert_eq!(leased.len(), fan_in);
    }
}
