//! Partition-aware deletion planning and execution for the shredder.
//!
//! A run discovers `(target, sources)` pairs for an environment, resolves
//! each target into partition tasks, and executes them against the
//! warehouse while recording every job in an append-only ledger so an
//! interrupted run resumes where it stopped.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod audit;
pub mod client_pool;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod execution;
pub mod ledger;
pub mod orchestrator;
pub mod partition;
pub mod query;
pub mod result;
pub mod rewrite;
pub mod sampling;
pub mod task;
pub mod warehouse;

// Re-export public API for convenience
pub use errors::ShredError;
pub use orchestrator::{run_shredder, run_with};
pub use result::{RunSummary, TableSummary};
pub use warehouse::{BigQueryClient, Warehouse, WarehouseError};
#[cfg(any(test, feature = "testing"))]
pub use warehouse::InMemoryWarehouse;
