//! Periodic flow creation from schedules.
//!
//! A due schedule is advanced with a version-checked update before its flow is
//! created. Of several processors evaluating the same due schedule only the one
//! whose update applies creates a flow.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dynaflow_types::error::ValidationError;
use dynaflow_types::event::EngineEvent;
use dynaflow_types::flow::Flow;
use dynaflow_types::ids::OwnerId;
use dynaflow_types::schedule::{FlowSchedule, MAX_FREQUENCY_IN_HOURS, NewFlowSchedule};
use tracing::{debug, error, info, warn};

use super::EngineError;
use super::builder::{FlowBuilder, FlowRequest};
use super::catalog::CatalogCache;
use crate::event::EventBus;
use crate::repository::{FlowStore, VersionedUpdate};

pub struct ScheduleTrigger<S> {
    store: Arc<S>,
    builder: Arc<FlowBuilder<S>>,
    catalog: Arc<CatalogCache>,
    events: EventBus,
}

impl<S: FlowStore> ScheduleTrigger<S> {
    pub fn new(store: Arc<S>, builder: Arc<FlowBuilder<S>>, catalog: Arc<CatalogCache>, events: EventBus) -> Self {
        Self {
            store,
            builder,
            catalog,
            events,
        }
    }

    /// Register a schedule. It first fires at `first_run_at`, or immediately.
    pub async fn add_schedule(
        &self,
        owner_id: OwnerId,
        flow_type: &str,
        frequency_in_hours: u32,
        first_run_at: Option<DateTime<Utc>>,
        param1: Option<String>,
    ) -> Result<FlowSchedule, EngineError> {
        if owner_id.get() <= 0 {
            return Err(ValidationError::InvalidOwner.into());
        }
        if !(1..=MAX_FREQUENCY_IN_HOURS).contains(&frequency_in_hours) {
            return Err(ValidationError::InvalidFrequency.into());
        }
        let flow_type = self
            .catalog
            .flow_type(flow_type)
            .ok_or_else(|| ValidationError::UnknownFlowType(flow_type.to_string()))?;

        let schedule = self
            .store
            .create_schedule(&NewFlowSchedule {
                owner_id,
                flow_type_id: flow_type.id,
                frequency_in_hours,
                is_active: true,
                next_run_at: first_run_at.unwrap_or_else(Utc::now),
                param1,
            })
            .await?;
        info!(
            schedule_id = %schedule.id,
            flow_type = %flow_type.lookup_enum_name,
            frequency_in_hours,
            next_run_at = %schedule.next_run_at,
            "schedule added"
        );
        Ok(schedule)
    }

    /// Fire every schedule due at `now` and return the flows created.
    ///
    /// A schedule that fires after a long outage fires once, not once per
    /// missed period.
    pub async fn process_due_schedules(
        &self,
        owner_id: Option<OwnerId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Flow>, EngineError> {
        let due = self.store.list_due_schedules(owner_id, now).await?;
        let mut flows = Vec::new();
        for schedule in due {
            if let Some(flow) = self.fire(&schedule, now).await? {
                flows.push(flow);
            }
        }
        Ok(flows)
    }

    async fn fire(&self, schedule: &FlowSchedule, now: DateTime<Utc>) -> Result<Option<Flow>, EngineError> {
        let mut advanced = schedule.clone();
        match schedule.next_run_after(now) {
            Ok(next_run_at) => {
                advanced.last_run_at = Some(now);
                advanced.next_run_at = next_run_at;
            }
            Err(e) => {
                // A schedule that cannot advance would fire on every pass.
                warn!(
                    schedule_id = %schedule.id,
                    frequency_in_hours = schedule.frequency_in_hours,
                    error = %e,
                    "deactivating schedule"
                );
                advanced.is_active = false;
                self.store.update_schedule(&advanced, schedule.last_change_code).await?;
                return Ok(None);
            }
        }
        if let VersionedUpdate::Stale = self.store.update_schedule(&advanced, schedule.last_change_code).await? {
            debug!(schedule_id = %schedule.id, "schedule fired by another processor");
            return Ok(None);
        }

        let Some(flow_type) = self.catalog.flow_type_by_id(schedule.flow_type_id) else {
            warn!(schedule_id = %schedule.id, flow_type_id = %schedule.flow_type_id, "schedule refers to unknown flow type");
            return Ok(None);
        };
        let mut request = FlowRequest::new(schedule.owner_id, flow_type.lookup_enum_name.clone())
            .description(format!("{} (schedule {})", flow_type.name, schedule.id));
        if let Some(param1) = &schedule.param1 {
            request = request.param1(param1.clone());
        }

        match self.builder.create_flow(&request).await {
            Ok(flow) => {
                info!(
                    schedule_id = %schedule.id,
                    flow_id = %flow.id,
                    next_run_at = %advanced.next_run_at,
                    "schedule fired"
                );
                self.events.publish(EngineEvent::ScheduleFired {
                    schedule_id: schedule.id,
                    flow_id: flow.id,
                });
                Ok(Some(flow))
            }
            Err(e) => {
                // The schedule already advanced; this run is skipped.
                error!(schedule_id = %schedule.id, error = %e, "scheduled flow creation failed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{OWNER, seeded};
    use crate::repository::memory::InMemoryFlowStore;
    use chrono::Duration;

    async fn trigger() -> (Arc<InMemoryFlowStore>, Arc<ScheduleTrigger<InMemoryFlowStore>>) {
        let (store, catalog) = seeded().await;
        let builder = Arc::new(FlowBuilder::new(store.clone(), catalog.clone(), 5));
        let trigger = ScheduleTrigger::new(store.clone(), builder, catalog, EventBus::default());
        (store, Arc::new(trigger))
    }

    #[tokio::test]
    async fn due_schedule_fires_once_and_advances() {
        let (store, trigger) = trigger().await;
        let now = Utc::now();
        let schedule = trigger
            .add_schedule(OWNER, "import", 6, Some(now - Duration::minutes(5)), Some("nightly".into()))
            .await
            .unwrap();

        let flows = trigger.process_due_schedules(None, now).await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].param1.as_deref(), Some("nightly"));
        assert!(!flows[0].is_task_creation_started);

        let stored = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run_at, Some(now));
        assert_eq!(stored.next_run_at, now + Duration::hours(6));

        assert!(trigger.process_due_schedules(None, now).await.unwrap().is_empty());
        let later = now + Duration::hours(6);
        assert_eq!(trigger.process_due_schedules(None, later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn racing_triggers_create_one_flow() {
        let (store, trigger) = trigger().await;
        let now = Utc::now();
        trigger.add_schedule(OWNER, "import", 1, Some(now), None).await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let trigger = trigger.clone();
                tokio::spawn(async move { trigger.process_due_schedules(None, now).await })
            })
            .collect();
        let mut created = 0;
        for handle in handles {
            created += handle.await.unwrap().unwrap().len();
        }
        assert_eq!(created, 1);
        assert_eq!(store.list_flows_by_owner(OWNER, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_snapshot_does_not_fire() {
        let (store, trigger) = trigger().await;
        let now = Utc::now();
        let schedule = trigger.add_schedule(OWNER, "import", 1, Some(now), None).await.unwrap();

        assert!(trigger.fire(&schedule, now).await.unwrap().is_some());
        assert!(trigger.fire(&schedule, now).await.unwrap().is_none());
        assert_eq!(store.list_flows_by_owner(OWNER, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_schedules() {
        let (_, trigger) = trigger().await;
        assert!(matches!(
            trigger.add_schedule(OWNER, "import", 0, None, None).await,
            Err(EngineError::Validation(ValidationError::InvalidFrequency))
        ));
        assert!(matches!(
            trigger.add_schedule(OWNER, "nope", 1, None, None).await,
            Err(EngineError::Validation(ValidationError::UnknownFlowType(_)))
        ));
    }

    #[tokio::test]
    async fn rejects_frequency_beyond_ten_years() {
        let (_, trigger) = trigger().await;
        assert!(matches!(
            trigger.add_schedule(OWNER, "import", u32::MAX, None, None).await,
            Err(EngineError::Validation(ValidationError::InvalidFrequency))
        ));
        assert!(
            trigger
                .add_schedule(OWNER, "import", MAX_FREQUENCY_IN_HOURS, None, None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn stored_schedule_that_cannot_advance_is_deactivated() {
        let (store, trigger) = trigger().await;
        let now = Utc::now();
        let schedule = trigger.add_schedule(OWNER, "import", 1, Some(now), None).await.unwrap();
        let mut oversized = schedule.clone();
        oversized.frequency_in_hours = u32::MAX;
        store.update_schedule(&oversized, schedule.last_change_code).await.unwrap();

        assert!(trigger.process_due_schedules(None, now).await.unwrap().is_empty());
        let stored = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(store.list_flows_by_owner(OWNER, 10).await.unwrap().is_empty());
        assert!(trigger.process_due_schedules(None, now).await.unwrap().is_empty());
    }
}
