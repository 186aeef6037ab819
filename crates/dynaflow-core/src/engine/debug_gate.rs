//! Manual gate for flows flagged for debugging.
//!
//! A task of a flow with `is_run_task_debug_required` is claimed normally but
//! waits here until released before its handler runs. Task creation for a flow
//! with `is_build_task_debug_required` is held the same way. A release that
//! arrives before the wait is remembered.

use dashmap::DashMap;
use dynaflow_types::ids::{FlowId, TaskId};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What is being held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GateKey {
    Task(TaskId),
    FlowBuild(FlowId),
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Released,
    Cancelled,
}

#[derive(Debug, Default)]
pub struct DebugGate {
    gates: DashMap<GateKey, CancellationToken>,
}

impl DebugGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` as held. Idempotent.
    pub fn hold(&self, key: GateKey) {
        self.gates.entry(key).or_default();
    }

    /// Let `key` proceed, now or whenever it next waits.
    pub fn release(&self, key: GateKey) {
        info!(?key, "debug gate released");
        self.gates.entry(key).or_default().cancel();
    }

    /// Consume a pending release for `key` without waiting.
    pub fn take_release(&self, key: GateKey) -> bool {
        self.gates
            .remove_if(&key, |_, token| token.is_cancelled())
            .is_some()
    }

    /// Wait until `key` is released or `cancel` fires.
    pub async fn wait(&self, key: GateKey, cancel: &CancellationToken) -> GateOutcome {
        let token = self.gates.entry(key).or_default().clone();
        let outcome = tokio::select! {
            _ = token.cancelled() => GateOutcome::Released,
            _ = cancel.cancelled() => GateOutcome::Cancelled,
        };
        self.gates.remove(&key);
        outcome
    }

    /// Keys currently held and not yet released, in key order.
    pub fn pending(&self) -> Vec<GateKey> {
        let mut keys: Vec<GateKey> = self
            .gates
            .iter()
            .filter(|e| !e.value().is_cancelled())
            .map(|e| *e.key())
            .collect();
        keys.sort();
        keys
    }
}
