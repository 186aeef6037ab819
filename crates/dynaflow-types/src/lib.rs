//! Shared domain types for the DynaFlow engine.
//!
//! Flow, Task, TaskDependency, the type catalog, schedules, engine
//! configuration and events, plus the error enums shared across crates.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod catalog;
pub mod config;
pub mod dependency;
pub mod error;
pub mod event;
pub mod flow;
pub mod ids;
pub mod schedule;
pub mod task;
