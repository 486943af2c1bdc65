//! Storage engines.
//!
//! The replication layer only ever mutates the store through committed log
//! entries, so every engine implements the same small [`engine::StoreEngine`]
//! contract: deterministic apply, point-in-time checkpoint, reopen from a
//! checkpoint, and a monotonic applied-sequence counter.

pub mod engine;
pub mod memory;
pub mod sqlite;
