//! The processor loop.
//!
//! One `FlowProcessor` is one worker instance. Each poll it finishes pending
//! cancellations, builds the tasks of flows waiting for it, and claims as many
//! ready tasks as it has free execution slots. Due schedules are fired on a
//! slower cadence. Any number of processors may share one store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dynaflow_types::config::EngineConfig;
use dynaflow_types::event::EngineEvent;
use dynaflow_types::flow::Flow;
use dynaflow_types::task::Task;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::EngineError;
use super::builder::FlowBuilder;
use super::cancellation::{CancelReport, CancellationPropagator};
use super::catalog::CatalogCache;
use super::claimer::TaskClaimer;
use super::completion::refresh_flow;
use super::debug_gate::{DebugGate, GateKey};
use super::executor::TaskExecutor;
use super::handler::HandlerRegistry;
use super::planner::PlannerRegistry;
use super::trigger::ScheduleTrigger;
use super::versioned::with_store_retry;
use crate::event::EventBus;
use crate::repository::FlowStore;

/// Lease identity for a processor without a configured one.
pub fn generate_processor_identifier() -> String {
    let suffix = Uuid::now_v7().simple().to_string();
    format!("dynaflow-{}-{}", std::process::id(), &suffix[suffix.len() - 8..])
}

pub struct FlowProcessor<S> {
    store: Arc<S>,
    config: EngineConfig,
    processor_identifier: String,
    catalog: Arc<CatalogCache>,
    planners: Arc<PlannerRegistry>,
    handled_task_types: Vec<String>,
    events: EventBus,
    gate: Arc<DebugGate>,
    builder: Arc<FlowBuilder<S>>,
    claimer: TaskClaimer<S>,
    executor: Arc<TaskExecutor<S>>,
    propagator: CancellationPropagator<S>,
    trigger: ScheduleTrigger<S>,
}

impl<S: FlowStore + 'static> FlowProcessor<S> {
    pub fn new(
        store: Arc<S>,
        catalog: Arc<CatalogCache>,
        handlers: HandlerRegistry,
        planners: PlannerRegistry,
        config: EngineConfig,
    ) -> Self {
        let processor_identifier = config
            .processor_identifier
            .clone()
            .unwrap_or_else(generate_processor_identifier);
        let events = EventBus::default();
        let gate = Arc::new(DebugGate::new());
        let mut handled_task_types: Vec<String> = handlers.task_types().map(str::to_string).collect();
        handled_task_types.sort();

        let builder = Arc::new(
            FlowBuilder::new(store.clone(), catalog.clone(), config.conflict_retry_limit).with_events(events.clone()),
        );
        let claimer = TaskClaimer::new(store.clone(), events.clone(), &config, processor_identifier.clone());
        let executor = Arc::new(TaskExecutor::new(
            store.clone(),
            catalog.clone(),
            Arc::new(handlers),
            events.clone(),
            gate.clone(),
            &config,
            processor_identifier.clone(),
        ));
        let propagator = CancellationPropagator::new(store.clone(), events.clone(), config.conflict_retry_limit);
        let trigger = ScheduleTrigger::new(store.clone(), builder.clone(), catalog.clone(), events.clone());

        Self {
            store,
            config,
            processor_identifier,
            catalog,
            planners: Arc::new(planners),
            handled_task_types,
            events,
            gate,
            builder,
            claimer,
            executor,
            propagator,
            trigger,
        }
    }

    pub fn processor_identifier(&self) -> &str {
        &self.processor_identifier
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn gate(&self) -> &Arc<DebugGate> {
        &self.gate
    }

    pub fn builder(&self) -> &Arc<FlowBuilder<S>> {
        &self.builder
    }

    pub fn propagator(&self) -> &CancellationPropagator<S> {
        &self.propagator
    }

    pub fn trigger(&self) -> &ScheduleTrigger<S> {
        &self.trigger
    }

    /// Poll until `shutdown` fires, then wait for in-flight tasks to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        let slots = self.config.max_concurrent_tasks.max(1);
        info!(
            processor = %self.processor_identifier,
            max_concurrent_tasks = slots,
            task_types = ?self.handled_task_types,
            "processor started"
        );

        let permits = Arc::new(Semaphore::new(slots));
        let mut running: JoinSet<()> = JoinSet::new();
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let schedule_every = Duration::from_secs(self.config.schedule_interval_secs.max(1));
        let mut next_schedule_run = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "task execution aborted");
                    }
                    continue;
                }
                _ = poll.tick() => {}
            }

            if Instant::now() >= next_schedule_run {
                next_schedule_run = Instant::now() + schedule_every;
                if let Err(e) = self.fire_schedules().await {
                    warn!(error = %e, "schedule pass failed");
                }
            }
            if let Err(e) = self.maintain().await {
                warn!(error = %e, "maintenance pass failed");
            }

            let capacity = permits.available_permits();
            if capacity == 0 {
                continue;
            }
            let leased = match self.claim(capacity).await {
                Ok(leased) => leased,
                Err(e) => {
                    warn!(error = %e, "claim pass failed");
                    continue;
                }
            };
            for task in leased {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let executor = self.executor.clone();
                let span = info_span!("task", task_id = %task.id, flow_id = %task.flow_id);
                running.spawn(
                    async move {
                        let _permit = permit;
                        let task_id = task.id;
                        if let Err(e) = executor.execute(task).await {
                            error!(task_id = %task_id, error = %e, "task finalisation failed");
                        }
                    }
                    .instrument(span),
                );
            }
        }

        info!(in_flight = running.len(), "processor stopping, draining tasks");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task execution aborted");
            }
        }
        info!(processor = %self.processor_identifier, "processor stopped");
        Ok(())
    }

    /// Fire due schedules, then poll and execute until nothing is claimable.
    ///
    /// Tasks waiting out a retry backoff are left for a later run.
    pub async fn run_until_idle(&self) -> Result<usize, EngineError> {
        self.fire_schedules().await?;
        let mut executed = 0;
        loop {
            let (_, built) = self.maintain().await?;
            let leased = self.claim(self.config.max_concurrent_tasks.max(1)).await?;
            if leased.is_empty() && built == 0 {
                break;
            }
            executed += leased.len();
            let runs = leased.into_iter().map(|task| self.executor.execute(task));
            for result in futures_util::future::join_all(runs).await {
                result?;
            }
        }
        Ok(executed)
    }

    /// Propagate pending cancellations and build pending flows.
    async fn maintain(&self) -> Result<(CancelReport, usize), EngineError> {
        let (limit, delay) = self.store_retry();
        let report = with_store_retry(limit, delay, || {
            self.propagator.sweep(self.config.owner_id, self.config.batch_size)
        })
        .await?;
        let built = with_store_retry(limit, delay, || self.build_pending_flows()).await?;
        Ok((report, built))
    }

    /// Refresh the catalog and fire due schedules. Returns the flows created.
    pub async fn fire_schedules(&self) -> Result<usize, EngineError> {
        let (limit, delay) = self.store_retry();
        with_store_retry(limit, delay, || async {
            self.catalog.refresh(self.store.as_ref()).await?;
            Ok::<(), EngineError>(())
        })
        .await?;
        let flows = with_store_retry(limit, delay, || {
            self.trigger.process_due_schedules(self.config.owner_id, Utc::now())
        })
        .await?;
        Ok(flows.len())
    }

    /// Lease up to `capacity` tasks of the types this processor handles.
    pub async fn claim(&self, capacity: usize) -> Result<Vec<Task>, EngineError> {
        if self.handled_task_types.is_empty() {
            return Ok(Vec::new());
        }
        let type_ids = self
            .catalog
            .task_type_ids_for(self.handled_task_types.iter().map(String::as_str));
        if type_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (limit, delay) = self.store_retry();
        with_store_retry(limit, delay, || self.claimer.claim(capacity, Some(type_ids.clone()))).await
    }

    /// Build tasks for flows waiting on a processor. Returns how many flows
    /// were built.
    pub async fn build_pending_flows(&self) -> Result<usize, EngineError> {
        let pending = self
            .store
            .list_flows_pending_task_build(self.config.owner_id, Utc::now(), self.config.batch_size)
            .await?;
        let mut built = 0;
        for flow in pending {
            let flow_id = flow.id;
            match self.build_flow(flow).await {
                Ok(true) => built += 1,
                Ok(false) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!(flow_id = %flow_id, error = %e, "task build failed"),
            }
        }
        Ok(built)
    }

    async fn build_flow(&self, flow: Flow) -> Result<bool, EngineError> {
        if let Some(dependency_id) = flow.dependency_flow_id {
            match self.store.get_flow(dependency_id).await? {
                Some(dependency) if dependency.is_succeeded() => {}
                Some(dependency) if !dependency.is_terminal() => {
                    debug!(flow_id = %flow.id, dependency_flow_id = %dependency_id, "waiting on dependency flow");
                    return Ok(false);
                }
                _ => {
                    warn!(
                        flow_id = %flow.id,
                        dependency_flow_id = %dependency_id,
                        "dependency flow did not succeed, canceling"
                    );
                    self.propagator.request_cancel(flow.id).await?;
                    return Ok(false);
                }
            }
        }

        if flow.is_build_task_debug_required {
            let key = GateKey::FlowBuild(flow.id);
            if !self.gate.take_release(key) {
                self.gate.hold(key);
                debug!(flow_id = %flow.id, "task build held for debugging");
                return Ok(false);
            }
        }

        let Some(flow_type) = self.catalog.flow_type_by_id(flow.type_id) else {
            warn!(flow_id = %flow.id, flow_type_id = %flow.type_id, "flow type not in catalog");
            return Ok(false);
        };
        let Some(planner) = self.planners.get(&flow_type.lookup_enum_name) else {
            debug!(flow_id = %flow.id, flow_type = %flow_type.lookup_enum_name, "no planner here, leaving flow");
            return Ok(false);
        };
        let Some(flow) = self
            .builder
            .claim_task_creation(&flow, &self.processor_identifier)
            .await?
        else {
            return Ok(false);
        };

        let plan = match planner.plan(&flow).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "planner failed");
                self.builder.fail_task_creation(flow.id, &e.0).await?;
                self.publish_completion(&flow);
                return Ok(false);
            }
        };
        let tasks = match self.builder.materialize_plan(&flow, &plan).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "task creation failed");
                self.builder.fail_task_creation(flow.id, &e.to_string()).await?;
                self.publish_completion(&flow);
                return Ok(false);
            }
        };
        self.builder.mark_tasks_created(flow.id).await?;

        info!(flow_id = %flow.id, tasks = tasks.len(), "tasks built");
        self.events.publish(EngineEvent::TasksBuilt {
            flow_id: flow.id,
            task_count: tasks.len(),
        });
        refresh_flow(self.store.as_ref(), &self.events, flow.id, self.config.conflict_retry_limit).await?;
        Ok(true)
    }

    fn publish_completion(&self, flow: &Flow) {
        self.events.publish(EngineEvent::FlowCompleted {
            flow_id: flow.id,
            is_successful: false,
        });
    }

    fn store_retry(&self) -> (u32, Duration) {
        (
            self.config.store_retry_limit,
            Duration::from_millis(self.config.store_retry_delay_ms),
        )
    }
}
