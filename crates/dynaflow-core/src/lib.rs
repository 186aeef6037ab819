//! Engine logic and store port definitions for DynaFlow.
//!
//! This crate defines the `FlowStore` port that the infrastructure layer
//! implements, plus every engine component written against it. It depends
//! only on `dynaflow-types` -- never on `dynaflow-infra` or any database crate.

pub mod engine;
pub mod event;
pub mod repository;
