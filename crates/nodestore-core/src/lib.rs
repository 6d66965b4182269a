//! Nodestore Core: embedded ordered key-value engine
//!
//! An in-process storage engine holding named, ordered keyspaces in RAM,
//! with a write-ahead log for crash safety and periodic snapshots to keep
//! recovery short.
//!
//! # Architecture
//!
//! - **Read path**: served from in-memory ordered maps under a shared lock
//! - **Write path**: log append first, then the in-memory update
//! - **Checkpoint**: snapshot of all databases; covered log segments deleted
//!
//! # Guarantees
//!
//! Every single-key put or delete is atomic and, with
//! [`Durability::Sync`], durable when the call returns. There are no
//! multi-key transactions.

pub mod checkpointer;
pub mod config;
pub mod durability;
pub mod env;
pub mod error;
pub mod format;
pub mod log;
pub mod snapshot;

pub use checkpointer::CheckpointStats;
pub use config::{Durability, EnvConfig};
pub use durability::{durable_sync, sync_directory};
pub use env::{Database, Environment};
pub use error::{KvError, KvResult};
pub use format::Operation;
pub use snapshot::CheckpointResult;
