//! Tracing setup for DynaFlow binaries.
//!
//! Structured logging through `tracing-subscriber`, with optional JSON output
//! and an OpenTelemetry bridge for span export.

pub mod tracing_setup;

pub use tracing_setup::{ObserveConfig, init_tracing, shutdown_tracing};
