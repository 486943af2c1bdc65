//! The consensus core contract and its event types.
//!
//! Trait methods that must await asynchronous work use manual desugaring
//! with pinned futures so the trait stays object-safe.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::errors::ReplicationError;

/// Identity of one cluster node.
///
/// Carries both the peer-to-peer consensus endpoint and the client API
/// endpoint so that a non-leader can resolve where to forward writes.
/// Immutable after start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub host: String,
    pub peering_port: u16,
    pub api_port: u16,
}

impl NodeIdentity {
    /// Parse a single `host:peering_port:api_port` triple.
    pub fn parse(s: &str) -> Result<Self, ReplicationError> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 || parts[0].is_empty() {
            return Err(ReplicationError::Config(format!(
                "node must be host:peering_port:api_port, got `{s}`"
            )));
        }
        let peering_port = parts[1]
            .parse()
            .map_err(|_| ReplicationError::Config(format!("bad peering port in `{s}`")))?;
        let api_port = parts[2]
            .parse()
            .map_err(|_| ReplicationError::Config(format!("bad api port in `{s}`")))?;
        Ok(Self {
            host: parts[0].to_string(),
            peering_port,
            api_port,
        })
    }

    /// The peer-to-peer endpoint as `host:port`.
    pub fn peering_addr(&self) -> PeerAddr {
        PeerAddr {
            host: self.host.clone(),
            peering_port: self.peering_port,
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.peering_port, self.api_port)
    }
}

/// Parse a comma-separated `host:peering_port:api_port` membership string.
pub fn parse_nodes_config(nodes: &str) -> Result<Vec<NodeIdentity>, ReplicationError> {
    nodes
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(NodeIdentity::parse)
        .collect()
}

/// Peer-to-peer address of a node, as known to the consensus core.
///
/// The core only speaks the peering protocol, so a leader hint carries no
/// API port; the replication layer resolves it against the committed
/// peer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: String,
    pub peering_port: u16,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.peering_port)
    }
}

/// A committed log entry handed to the apply pipeline.
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    /// Log index, contiguous and strictly increasing.
    pub index: u64,
    /// Term under which the entry was committed.
    pub term: i64,
    /// Serialized operation payload.
    pub data: Bytes,
    /// Token linking this entry to a local in-flight write, if any.
    /// Entries replayed during catch-up carry `None`.
    pub op_id: Option<u64>,
}

/// Completion channel for a snapshot trigger.  The snapshot coordinator
/// answers with the published applied index, or the error.
pub type SnapshotDone = oneshot::Sender<Result<u64, ReplicationError>>;

/// Events emitted by the consensus core.
///
/// Delivered in order on a single channel; channel closure is the
/// shutdown signal for the consumer.
#[derive(Debug)]
pub enum ConsensusEvent {
    /// A batch of entries committed in log order.
    Committed(Vec<CommittedEntry>),

    /// This node became leader for `term`.
    LeaderStart { term: i64 },

    /// This node stepped down.
    LeaderStop { reason: String },

    /// A configuration change committed; `peers` is the new full set.
    ConfigurationCommitted { peers: Vec<NodeIdentity> },

    /// The core asks for a snapshot to be taken.  `ext_snapshot_path` is
    /// carried through opaquely from the request that triggered it (always
    /// `None` for the core's own periodic/count triggers).
    SnapshotRequested {
        ext_snapshot_path: Option<PathBuf>,
        done: SnapshotDone,
    },

    /// A non-fatal peering error was observed.
    Error { message: String },
}

/// Opaque consensus collaborator.
///
/// Implementations must deliver [`ConsensusEvent`]s in order and must stop
/// delivering (close the channel) once [`ConsensusCore::shutdown`] has been
/// called.  Teardown ordering is `shutdown()` then `join()`.
pub trait ConsensusCore: Send + Sync + 'static {
    /// Submit an entry for replication.  `op_id` ties the eventual
    /// committed entry back to a local completion handle; replicated
    /// copies on other nodes see `None`.
    fn propose(&self, data: Bytes, op_id: Option<u64>) -> Result<(), ReplicationError>;

    /// Whether this node currently believes itself leader.
    fn is_leader(&self) -> bool;

    /// Current term while leader, `-1` otherwise.
    fn term(&self) -> i64;

    /// Peering address of the current leader, if known.
    fn leader_hint(&self) -> Option<PeerAddr>;

    /// Highest committed log index known cluster-wide.
    fn last_committed_index(&self) -> u64;

    /// Submit a configuration change replacing the peer set.  Completion
    /// is reported asynchronously via `ConfigurationCommitted`.
    fn refresh_peers(&self, peers: Vec<NodeIdentity>) -> Result<(), ReplicationError>;

    /// Ask the core to start an election.
    fn trigger_vote(&self) -> Result<(), ReplicationError>;

    /// Request an out-of-band snapshot; resolves once the snapshot
    /// coordinator has published (or failed) it.  `ext_snapshot_path` is
    /// passed through to the resulting [`ConsensusEvent::SnapshotRequested`]
    /// untouched.
    fn request_snapshot(
        &self,
        ext_snapshot_path: Option<PathBuf>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ReplicationError>> + Send + '_>>;

    /// Stop the core.  Closes the event channel.
    fn shutdown(&self);

    /// Wait until the core has fully stopped.  Idempotent.
    fn join(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

// -- Tests --------------------------------------------------------------------
