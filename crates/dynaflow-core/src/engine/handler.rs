//! Task handler port.
//!
//! The work a task performs is external code, registered per task type
//! `lookup_enum_name`. Handlers receive the task's parameters and a
//! cancellation token they are expected to check at safe points.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dynaflow_types::ids::{FlowId, TaskId};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Input for one task attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_code: Uuid,
    pub flow_id: FlowId,
    pub subject_code: Option<Uuid>,
    pub param1: Option<String>,
    pub param2: Option<String>,
    /// 0 on the first attempt.
    pub retry_count: u32,
    /// Fires when the task or its flow is canceled.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Why an attempt did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Subject to the retry policy.
    #[error("{0}")]
    Failed(String),

    /// The handler observed the cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,
}

/// Work for one task type. Returns the task's result value.
pub trait TaskHandler: Send + Sync {
    fn run(&self, ctx: TaskContext) -> impl Future<Output = Result<String, TaskError>> + Send;
}

/// Object-safe version of [`TaskHandler`] with boxed futures.
pub trait TaskHandlerDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        ctx: TaskContext,
    ) -> Pin<Box<dyn Future<Output = Result<String, TaskError>> + Send + 'a>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn run_boxed<'a>(
        &'a self,
        ctx: TaskContext,
    ) -> Pin<Box<dyn Future<Output = Result<String, TaskError>> + Send + 'a>> {
        Box::pin(self.run(ctx))
    }
}

/// Type-erased task handler.
pub struct BoxTaskHandler {
    inner: Box<dyn TaskHandlerDyn + Send + Sync>,
}

impl BoxTaskHandler {
    pub fn new<T: TaskHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn run(&self, ctx: TaskContext) -> Result<String, TaskError> {
        self.inner.run_boxed(ctx).await
    }
}

/// Handlers keyed by task type `lookup_enum_name`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<BoxTaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TaskHandler + 'static>(&mut self, task_type: impl Into<String>, handler: T) {
        self.handlers
            .insert(task_type.into(), Arc::new(BoxTaskHandler::new(handler)));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<BoxTaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Task types this registry can execute.
    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
