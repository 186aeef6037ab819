//! SQLite storage layer.
//!
//! The `FlowStore` implementation backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteFlowStore;
