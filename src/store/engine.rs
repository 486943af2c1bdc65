//! Abstract storage engine trait and the replicated operation types.
//!
//! [`StoreOperation`] is the unit carried inside a log entry.  Its JSON
//! encoding is the wire format clients submit and the bytes the consensus
//! core replicates, so it must stay stable across versions.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// One replicated mutation.
///
/// Serialized as `{"op":"SET","key":...,"value":...}` and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum StoreOperation {
    /// Set `key` to `value`.
    #[serde(rename = "SET")]
    Set { key: String, value: String },

    /// Remove `key` if present.
    #[serde(rename = "DELETE")]
    Delete { key: String },

    /// No-op entry.  Used by the configurable init-snapshot dummy write and
    /// by catch-up replay of internal entries.
    #[serde(rename = "NO_OP")]
    NoOp,
}

/// Result of applying one operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    /// The value written, for `SET`; `None` otherwise.
    pub value: Option<String>,
}

/// Storage engine contract.
///
/// `apply` must be deterministic: replaying the same operations in the same
/// order from any starting checkpoint must reproduce the same state.  The
/// engine maintains its own monotonically increasing sequence counter,
/// advanced once per applied operation and preserved across
/// checkpoint/reopen.
pub trait StoreEngine: Send + Sync + 'static {
    /// Apply one committed operation.
    fn apply(&self, op: &StoreOperation) -> anyhow::Result<ApplyResult>;

    /// Read a value.  Reads do not go through the replicated log.
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Write a consistent point-in-time copy of the data into `dir`.
    fn checkpoint(&self, dir: &Path) -> anyhow::Result<()>;

    /// Replace the engine's state with the data previously checkpointed
    /// into `dir`.
    fn reopen(&self, dir: &Path) -> anyhow::Result<()>;

    /// Number of operations applied so far.
    fn current_sequence(&self) -> u64;
}

// -- Tests --------------------------------------------------------------------
