//! The replication state machine.
//!
//! Turns consensus-committed log entries into deterministic, exactly-once
//! writes against the storage engine, manages snapshot lifecycle, gates
//! readiness on replication lag, and forwards writes received by a
//! non-leader to the current leader.

pub mod apply;
pub mod catchup;
pub mod forward;
pub mod pending;
pub mod snapshot;
pub mod state;
