//! Flow and task type catalog entries.
//!
//! Application code refers to types by `lookup_enum_name`, a stable key that
//! survives renames of the display `name`. Numeric ids are storage-only.

use serde::{Deserialize, Serialize};

use crate::ids::{FlowTypeId, OwnerId, TaskTypeId};

/// Default priority for flow types that do not set one.
pub const DEFAULT_PRIORITY_LEVEL: i32 = 100;

/// Catalog row describing a kind of flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowType {
    pub id: FlowTypeId,
    pub pac_id: OwnerId,
    pub name: String,
    pub lookup_enum_name: String,
    #[serde(default)]
    pub description: String,
    /// Copied onto each new flow; lower values are served first.
    #[serde(default = "default_priority_level")]
    pub priority_level: i32,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Catalog row describing a kind of task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskType {
    pub id: TaskTypeId,
    pub pac_id: OwnerId,
    pub name: String,
    pub lookup_enum_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority_level")]
    pub priority_level: i32,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Applied when a plan does not set its own retry budget.
    #[serde(default)]
    pub max_retry_count: u32,
    #[serde(default = "default_true")]
    pub is_parallel_run_allowed: bool,
}

fn default_priority_level() -> i32 {
    DEFAULT_PRIORITY_LEVEL
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_defaults_from_json() {
        let json = r#"{"id": 4, "pac_id": 1, "name": "Echo", "lookup_enum_name": "echo"}"#;
        let tt: TaskType = serde_json::from_str(json).unwrap();
        assert_eq!(tt.id, TaskTypeId(4));
        assert_eq!(tt.priority_level, DEFAULT_PRIORITY_LEVEL);
        assert!(tt.is_active);
        assert!(tt.is_parallel_run_allowed);
        assert_eq!(tt.max_retry_count, 0);
    }

    #[test]
    fn flow_type_explicit_priority() {
        let json = r#"{"id": 1, "pac_id": 1, "name": "Import", "lookup_enum_name": "import", "priority_level": 1, "is_active": false}"#;
        let ft: FlowType = serde_json::from_str(json).unwrap();
        assert_eq!(ft.priority_level, 1);
        assert!(!ft.is_active);
    }
}
