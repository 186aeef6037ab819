//! In-memory cache of the flow and task type catalog.
//!
//! Application code refers to types by `lookup_enum_name`; the engine's hot
//! paths map between ids and names on every scheduling decision, so both
//! directions are served from memory and refreshed from the store on demand.

use dashmap::DashMap;
use dynaflow_types::catalog::{FlowType, TaskType};
use dynaflow_types::error::RepositoryError;
use dynaflow_types::ids::{FlowTypeId, TaskTypeId};
use tracing::debug;

use crate::repository::FlowStore;

/// Catalog lookups by stable name or storage id.
#[derive(Debug, Default)]
pub struct CatalogCache {
    flow_types: DashMap<String, FlowType>,
    flow_type_names: DashMap<FlowTypeId, String>,
    task_types: DashMap<String, TaskType>,
    task_type_names: DashMap<TaskTypeId, String>,
}

impl CatalogCache {
    /// Build a cache populated from the store.
    pub async fn load<S: FlowStore>(store: &S) -> Result<Self, RepositoryError> {
        let cache = Self::default();
        cache.refresh(store).await?;
        Ok(cache)
    }

    /// Reload every catalog row. Entries removed from the store are dropped.
    pub async fn refresh<S: FlowStore>(&self, store: &S) -> Result<(), RepositoryError> {
        let flow_types = store.list_flow_types().await?;
        let task_types = store.list_task_types().await?;

        self.flow_types.clear();
        self.flow_type_names.clear();
        self.task_types.clear();
        self.task_type_names.clear();

        for ft in flow_types {
            self.insert_flow_type(ft);
        }
        for tt in task_types {
            self.insert_task_type(tt);
        }
        debug!(
            flow_types = self.flow_types.len(),
            task_types = self.task_types.len(),
            "catalog refreshed"
        );
        Ok(())
    }

    pub fn insert_flow_type(&self, flow_type: FlowType) {
        self.flow_type_names
            .insert(flow_type.id, flow_type.lookup_enum_name.clone());
        self.flow_types
            .insert(flow_type.lookup_enum_name.clone(), flow_type);
    }

    pub fn insert_task_type(&self, task_type: TaskType) {
        self.task_type_names
            .insert(task_type.id, task_type.lookup_enum_name.clone());
        self.task_types
            .insert(task_type.lookup_enum_name.clone(), task_type);
    }

    pub fn flow_type(&self, lookup_enum_name: &str) -> Option<FlowType> {
        self.flow_types.get(lookup_enum_name).map(|e| e.value().clone())
    }

    pub fn flow_type_by_id(&self, id: FlowTypeId) -> Option<FlowType> {
        let name = self.flow_type_names.get(&id)?.value().clone();
        self.flow_type(&name)
    }

    pub fn task_type(&self, lookup_enum_name: &str) -> Option<TaskType> {
        self.task_types.get(lookup_enum_name).map(|e| e.value().clone())
    }

    pub fn task_type_by_id(&self, id: TaskTypeId) -> Option<TaskType> {
        let name = self.task_type_names.get(&id)?.value().clone();
        self.task_type(&name)
    }

    /// Ids of the task types whose lookup name is in `names`.
    pub fn task_type_ids_for<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<TaskTypeId> {
        let mut ids: Vec<TaskTypeId> = names
            .into_iter()
            .filter_map(|name| self.task_types.get(name).map(|e| e.value().id))
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{flow_type, task_type};
    use crate::repository::memory::InMemoryFlowStore;

    #[tokio::test]
    async fn lookups_by_name_and_id_agree() {
        let store = InMemoryFlowStore::new();
        let stored = store.upsert_flow_type(&flow_type("import", 5)).await.unwrap();
        store.upsert_task_type(&task_type("echo", 1, true)).await.unwrap();

        let cache = CatalogCache::load(&store).await.unwrap();
        assert_eq!(cache.flow_type("import"), Some(stored.clone()));
        assert_eq!(cache.flow_type_by_id(stored.id), Some(stored));
        assert_eq!(cache.task_type("echo").unwrap().max_retry_count, 1);
        assert!(cache.flow_type("missing").is_none());
    }

    #[tokio::test]
    async fn refresh_picks_up_changes() {
        let store = InMemoryFlowStore::new();
        let cache = CatalogCache::load(&store).await.unwrap();
        assert!(cache.task_type("echo").is_none());

        let echo = store.upsert_task_type(&task_type("echo", 0, true)).await.unwrap();
        store.upsert_task_type(&task_type("fail", 0, true)).await.unwrap();
        cache.refresh(&store).await.unwrap();

        assert_eq!(cache.task_type_by_id(echo.id).unwrap().lookup_enum_name, "echo");
        assert_eq!(cache.task_type_ids_for(["echo", "unknown"]), vec![echo.id]);
    }
}
