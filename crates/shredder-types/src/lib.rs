//! Shared model types for the shredder deletion engine.
//!
//! Pure data types used by the engine, the ledger backends and the CLI.
//! Kept in their own crate so the state and engine crates can share them
//! without circular dependencies.

#![warn(clippy::pedantic)]

pub mod partition;
pub mod state;
pub mod table;
pub mod warehouse;
