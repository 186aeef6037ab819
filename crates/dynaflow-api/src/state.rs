//! Application state wiring the store and engine components together.
//!
//! Engine components are generic over the `FlowStore` port; AppState pins
//! them to the SQLite implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dynaflow_core::engine::builder::FlowBuilder;
use dynaflow_core::engine::cancellation::CancellationPropagator;
use dynaflow_core::engine::catalog::CatalogCache;
use dynaflow_core::engine::processor::FlowProcessor;
use dynaflow_core::engine::trigger::ScheduleTrigger;
use dynaflow_core::event::EventBus;
use dynaflow_infra::config::load_engine_config;
use dynaflow_infra::filesystem::{database_path, ensure_data_dir, resolve_data_dir};
use dynaflow_infra::sqlite::{DatabasePool, SqliteFlowStore};
use dynaflow_types::config::EngineConfig;
use dynaflow_types::ids::OwnerId;

use crate::builtin;

/// Concrete engine types pinned to the SQLite store.
pub type ConcreteBuilder = FlowBuilder<SqliteFlowStore>;
pub type ConcretePropagator = CancellationPropagator<SqliteFlowStore>;
pub type ConcreteProcessor = FlowProcessor<SqliteFlowStore>;

/// Shared state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteFlowStore>,
    pub catalog: Arc<CatalogCache>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Connect to the database, run migrations, load config and the catalog.
    pub async fn init(database_url: Option<&str>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let db_url = match database_url {
            Some(url) => url.to_string(),
            None => format!("sqlite://{}?mode=rwc", database_path(&data_dir).display()),
        };
        let config = load_engine_config(&data_dir).await;
        // One reader per concurrent task plus headroom for the claimer and trigger.
        let readers = u32::try_from(config.max_concurrent_tasks)
            .unwrap_or(u32::MAX)
            .saturating_add(2)
            .min(32);
        let pool = DatabasePool::with_readers(&db_url, readers)
            .await
            .with_context(|| format!("Failed to open database {db_url}"))?;
        let store = Arc::new(SqliteFlowStore::new(pool));

        let catalog = Arc::new(
            CatalogCache::load(store.as_ref())
                .await
                .context("Failed to load the type catalog")?,
        );

        Ok(Self {
            store,
            catalog,
            config,
            data_dir,
        })
    }

    pub fn builder(&self) -> ConcreteBuilder {
        FlowBuilder::new(self.store.clone(), self.catalog.clone(), self.config.conflict_retry_limit)
    }

    pub fn propagator(&self) -> ConcretePropagator {
        CancellationPropagator::new(self.store.clone(), EventBus::default(), self.config.conflict_retry_limit)
    }

    pub fn trigger(&self) -> ScheduleTrigger<SqliteFlowStore> {
        ScheduleTrigger::new(
            self.store.clone(),
            Arc::new(self.builder()),
            self.catalog.clone(),
            EventBus::default(),
        )
    }

    /// A processor running the built-in handlers and planners.
    ///
    /// `owner` overrides the configured owner scope.
    pub fn processor(&self, owner: Option<OwnerId>) -> ConcreteProcessor {
        let mut config = self.config.clone();
        if owner.is_some() {
            config.owner_id = owner;
        }
        FlowProcessor::new(
            self.store.clone(),
            self.catalog.clone(),
            builtin::handlers(),
            builtin::planners(),
            config,
        )
    }
}
