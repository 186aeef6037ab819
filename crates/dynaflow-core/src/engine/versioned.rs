//! Re-read and re-apply loops around version-checked updates.
//!
//! A `Stale` outcome means someone else changed the record since we read it.
//! The caller's decision must be re-made against fresh state, so each attempt
//! re-reads the record and runs the mutation closure again.

use std::future::Future;
use std::time::Duration;

use dynaflow_types::flow::Flow;
use dynaflow_types::ids::{FlowId, TaskId};
use dynaflow_types::task::Task;
use tracing::{debug, warn};

use super::EngineError;
use crate::repository::{FlowStore, VersionedUpdate};

/// Result of a mutation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
    /// The change was written. Holds the record with its new version token.
    Applied(T),
    /// The closure declined to change the fresh record. Holds that record.
    Skipped(T),
}

impl<T> Mutation<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Mutation::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Mutation::Applied(t) | Mutation::Skipped(t) => t,
        }
    }
}

/// Read flow `id`, let `apply` mutate it, and write it back if it returned
/// `true`. Repeats on version conflicts up to `limit` attempts.
pub async fn update_flow_with<S, F>(
    store: &S,
    id: FlowId,
    limit: u32,
    mut apply: F,
) -> Result<Mutation<Flow>, EngineError>
where
    S: FlowStore,
    F: FnMut(&mut Flow) -> Result<bool, EngineError> + Send,
{
    for attempt in 1..=limit.max(1) {
        let current = store.get_flow(id).await?.ok_or(EngineError::FlowNotFound(id))?;
        let mut next = current.clone();
        if !apply(&mut next)? {
            return Ok(Mutation::Skipped(current));
        }
        match store.update_flow(&next, current.last_change_code).await? {
            VersionedUpdate::Applied(version) => {
                next.last_change_code = version;
                return Ok(Mutation::Applied(next));
            }
            VersionedUpdate::Stale => {
                debug!(flow_id = %id, attempt, "flow version conflict, re-reading");
            }
        }
    }
    Err(EngineError::ConflictRetriesExhausted {
        entity: format!("flow {id}"),
        attempts: limit.max(1),
    })
}

/// Task counterpart of [`update_flow_with`].
pub async fn update_task_with<S, F>(
    store: &S,
    id: TaskId,
    limit: u32,
    mut apply: F,
) -> Result<Mutation<Task>, EngineError>
where
    S: FlowStore,
    F: FnMut(&mut Task) -> Result<bool, EngineError> + Send,
{
    for attempt in 1..=limit.max(1) {
        let current = store.get_task(id).await?.ok_or(EngineError::TaskNotFound(id))?;
        let mut next = current.clone();
        if !apply(&mut next)? {
            return Ok(Mutation::Skipped(current));
        }
        match store.update_task(&next, current.last_change_code).await? {
            VersionedUpdate::Applied(version) => {
                next.last_change_code = version;
                return Ok(Mutation::Applied(next));
            }
            VersionedUpdate::Stale => {
                debug!(task_id = %id, attempt, "task version conflict, re-reading");
            }
        }
    }
    Err(EngineError::ConflictRetriesExhausted {
        entity: format!("task {id}"),
        attempts: limit.max(1),
    })
}

/// Run `op`, retrying transient store failures with a fixed delay.
///
/// Non-transient errors and the last transient error are returned as-is.
pub async fn with_store_retry<T, F, Fut>(
    limit: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let attempts = limit.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, error = %e, "transient store error, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryFlowStore;
    use crate::repository::memory::tests::new_flow;
    use dynaflow_types::error::RepositoryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn applied_mutation_carries_new_version() {
        let store = InMemoryFlowStore::new();
        let flow = store.create_flow(&new_flow(1, 5)).await.unwrap();

        let result = update_flow_with(&store, flow.id, 3, |f| {
            f.is_paused = true;
            Ok(true)
        })
        .await
        .unwrap();

        let updated = match result {
            Mutation::Applied(f) => f,
            other => panic!("expected applied, got {other:?}"),
        };
        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert_eq!(updated, stored);
        assert_ne!(stored.last_change_code, flow.last_change_code);
    }

    #[tokio::test]
    async fn declined_mutation_writes_nothing() {
        let store = InMemoryFlowStore::new();
        let flow = store.create_flow(&new_flow(1, 5)).await.unwrap();

        let result = update_flow_with(&store, flow.id, 3, |_| Ok(false)).await.unwrap();
        assert_eq!(result, Mutation::Skipped(flow.clone()));
        let stored = store.get_flow(flow.id).await.unwrap().unwrap();
        assert_eq!(stored.last_change_code, flow.last_change_code);
    }

    #[tokio::test]
    async fn missing_flow_is_reported() {
        let store = InMemoryFlowStore::new();
        let err = update_flow_with(&store, FlowId(42), 3, |_| Ok(true)).await.unwrap_err();
        assert!(matches!(err, EngineError::FlowNotFound(FlowId(42))));
    }

    #[tokio::test]
    async fn closure_error_aborts() {
        let store = InMemoryFlowStore::new();
        let flow = store.create_flow(&new_flow(1, 5)).await.unwrap();
        let err = update_flow_with(&store, flow.id, 3, |f| Err(EngineError::TasksAlreadyCreated(f.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TasksAlreadyCreated(_)));
    }

    #[tokio::test]
    async fn store_retry_gives_up_after_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), EngineError> = with_store_retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RepositoryError::Transient("database is locked".into()).into()) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn store_retry_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), EngineError> = with_store_retry(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RepositoryError::NotFound.into()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_retry_recovers() {
        let calls = AtomicU32::new(0);
        let value = with_store_retry(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RepositoryError::Connection.into())
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }
}
