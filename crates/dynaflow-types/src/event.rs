//! Engine lifecycle events published on the event bus.

use serde::{Deserialize, Serialize};

use crate::ids::{FlowId, ScheduleId, TaskId};

/// Something observable happened to a task, flow or schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskClaimed {
        task_id: TaskId,
        flow_id: FlowId,
        processor: String,
    },
    TaskSucceeded {
        task_id: TaskId,
        flow_id: FlowId,
        duration_ms: u64,
    },
    TaskRetryScheduled {
        task_id: TaskId,
        flow_id: FlowId,
        retry_count: u32,
        error: String,
    },
    TaskFailed {
        task_id: TaskId,
        flow_id: FlowId,
        error: String,
    },
    TaskCanceled {
        task_id: TaskId,
        flow_id: FlowId,
    },
    TasksBuilt {
        flow_id: FlowId,
        task_count: usize,
    },
    FlowCompleted {
        flow_id: FlowId,
        is_successful: bool,
    },
    FlowCanceled {
        flow_id: FlowId,
    },
    ScheduleFired {
        schedule_id: ScheduleId,
        flow_id: FlowId,
    },
}

impl EngineEvent {
    /// The flow the event concerns.
    pub fn flow_id(&self) -> FlowId {
        match self {
            EngineEvent::TaskClaimed { flow_id, .. }
            | EngineEvent::TaskSucceeded { flow_id, .. }
            | EngineEvent::TaskRetryScheduled { flow_id, .. }
            | EngineEvent::TaskFailed { flow_id, .. }
            | EngineEvent::TaskCanceled { flow_id, .. }
            | EngineEvent::TasksBuilt { flow_id, .. }
            | EngineEvent::FlowCompleted { flow_id, .. }
            | EngineEvent::FlowCanceled { flow_id }
            | EngineEvent::ScheduleFired { flow_id, .. } => *flow_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = EngineEvent::TaskCanceled {
            task_id: TaskId(4),
            flow_id: FlowId(2),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_canceled");
        assert_eq!(json["task_id"], 4);
        assert_eq!(event.flow_id(), FlowId(2));
    }
}
