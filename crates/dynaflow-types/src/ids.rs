//! Storage-assigned identifiers.
//!
//! Ids are positive 64-bit integers handed out by the store on insert. They are
//! storage-only: application code that needs a stable key uses the record's
//! `code` (UUID) or, for catalog entries, the `lookup_enum_name`. A missing
//! reference ("0 = none" in the relational schema) is `Option<Id>` in Rust.

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

macro_rules! storage_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Raw integer value as stored.
            pub fn get(self) -> i64 {
                self.0
            }

            /// Interpret a raw column value, mapping `0` and negatives to `None`.
            pub fn from_raw(raw: i64) -> Option<Self> {
                (raw > 0).then_some(Self(raw))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.trim().parse()?))
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

storage_id!(
    /// Identifier of a [`Flow`](crate::flow::Flow).
    FlowId
);
storage_id!(
    /// Identifier of a [`Task`](crate::task::Task).
    TaskId
);
storage_id!(
    /// Identifier of a [`TaskDependency`](crate::dependency::TaskDependency) edge.
    DependencyId
);
storage_id!(
    /// Identifier of a [`FlowSchedule`](crate::schedule::FlowSchedule).
    ScheduleId
);
storage_id!(
    /// Identifier of a [`FlowType`](crate::catalog::FlowType) catalog row.
    FlowTypeId
);
storage_id!(
    /// Identifier of a [`TaskType`](crate::catalog::TaskType) catalog row.
    TaskTypeId
);
storage_id!(
    /// Tenant that owns flows, schedules and catalog rows (the "pac").
    OwnerId
);
