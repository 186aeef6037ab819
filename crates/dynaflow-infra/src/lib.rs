//! Infrastructure layer for DynaFlow.
//!
//! Contains the SQLite implementation of the `FlowStore` port defined in
//! `dynaflow-core`, the data directory layout and the `dynaflow.toml` loader.

pub mod config;
pub mod filesystem;
pub mod sqlite;
