//! replistore: a replication state-machine layer between a consensus core
//! and a pluggable storage engine.
//!
//! The consensus core decides what committed and in which order; this
//! crate turns those decisions into deterministic, exactly-once writes
//! against the store, takes and restores snapshots, gates readiness on
//! replication lag, and forwards writes that land on a non-leader to the
//! current leader's HTTP API.

use std::sync::Arc;

pub mod config;
pub mod consensus;
pub mod errors;
pub mod metrics;
pub mod replication;
pub mod server;
pub mod store;

use crate::config::Config;
use crate::replication::state::ReplicationState;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub replication: Arc<ReplicationState>,
}
