//! Ledger persistence for the shredder engine.
//!
//! Provides the [`StateLedger`] and [`TaskLedger`] traits, the
//! [`LedgerSnapshot`] consulted during a run, and a [`SqliteLedger`]
//! implementation for local job and task tracking.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::{load_snapshot, LedgerSnapshot, StateLedger, TaskLedger};
pub use error::StateError;
pub use sqlite::SqliteLedger;
