//! Replication state machine facade.
//!
//! `ReplicationState` wires the consensus core, apply pipeline, snapshot
//! coordinator, catch-up monitor and forwarder together and is the one
//! object HTTP handlers talk to.  Bootstrap order matters: directories
//! first, then snapshot load (which decides the replay point), then the
//! consensus core (which replays the log tail), then the apply pipeline.
//!
//! Teardown is the reverse: mark shutting down so no new writes are
//! accepted, stop the core (closing the event channel), then `join` the
//! pipeline, which drains every in-flight write on its way out.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::consensus::core::{
    parse_nodes_config, ConsensusCore, ConsensusEvent, NodeIdentity,
};
use crate::consensus::local::{LocalConsensus, LocalConsensusOptions};
use crate::errors::ReplicationError;
use crate::metrics::WRITES_TOTAL;
use crate::replication::apply::ApplyPipeline;
use crate::replication::catchup::CatchUpMonitor;
use crate::replication::forward::Forwarder;
use crate::replication::pending::{PendingOps, WriteOutcome};
use crate::replication::snapshot::{SnapshotCoordinator, LOG_DIR_NAME};
use crate::store::engine::{ApplyResult, StoreEngine, StoreOperation};

/// Forwarding timeout for leader-bound writes.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a client write as seen by the HTTP layer.
#[derive(Debug)]
pub enum WriteResponse {
    /// Applied locally (this node was the leader).
    Applied(ApplyResult),
    /// Relayed from the leader; status and body are passed through
    /// verbatim.
    Forwarded { status: u16, body: String },
}

/// Point-in-time view of the node for `/status`.
#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub state: &'static str,
    pub term: i64,
    pub committed_index: u64,
    pub applied_index: u64,
    pub ready: bool,
    pub pending_writes: usize,
    pub peers: Vec<String>,
}

/// The replication layer's top-level handle.
pub struct ReplicationState {
    node: NodeIdentity,
    core: Arc<dyn ConsensusCore>,
    store: Arc<dyn StoreEngine>,
    pending: Arc<PendingOps>,
    catchup: Arc<CatchUpMonitor>,
    forwarder: Forwarder,
    applied_index: Arc<AtomicU64>,
    leader_term: Arc<AtomicI64>,
    peers: Arc<RwLock<Vec<NodeIdentity>>>,
    shutting_down: Arc<AtomicBool>,
    pipeline: Mutex<Option<JoinHandle<Result<(), ReplicationError>>>>,
    fatal_tx: watch::Sender<bool>,
}

impl ReplicationState {
    /// Bring the replication layer up against `store`, rooted at the
    /// configured data directory.
    pub fn bootstrap(
        config: &Config,
        store: Arc<dyn StoreEngine>,
    ) -> Result<Arc<Self>, ReplicationError> {
        let data_dir = PathBuf::from(&config.replication.data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let node = NodeIdentity {
            host: config.server.host.clone(),
            peering_port: config.replication.peering_port,
            api_port: config.server.api_port,
        };
        let mut peers = parse_nodes_config(&config.replication.nodes)?;
        if peers.is_empty() {
            peers.push(node.clone());
        }

        let applied_index = Arc::new(AtomicU64::new(0));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let snapshots = Arc::new(SnapshotCoordinator::new(
            &data_dir,
            store.clone(),
            applied_index.clone(),
            shutting_down.clone(),
        ));
        let loaded = snapshots.load()?;

        let (core, events) = LocalConsensus::open(
            node.clone(),
            &data_dir.join(LOG_DIR_NAME),
            peers,
            loaded + 1,
            LocalConsensusOptions {
                snapshot_interval_s: config.replication.snapshot_interval_s,
                snapshot_max_log_entries: config.replication.snapshot_max_log_entries,
            },
        )?;

        Self::assemble(
            config,
            node,
            core,
            events,
            store,
            snapshots,
            applied_index,
            shutting_down,
        )
    }

    /// Assemble the state around an already-open core.  Split out of
    /// [`ReplicationState::bootstrap`] so tests can substitute the core.
    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: &Config,
        node: NodeIdentity,
        core: Arc<dyn ConsensusCore>,
        events: mpsc::UnboundedReceiver<ConsensusEvent>,
        store: Arc<dyn StoreEngine>,
        snapshots: Arc<SnapshotCoordinator>,
        applied_index: Arc<AtomicU64>,
        shutting_down: Arc<AtomicBool>,
    ) -> Result<Arc<Self>, ReplicationError> {
        let pending = Arc::new(PendingOps::new());
        let catchup = Arc::new(CatchUpMonitor::new(
            config.replication.catchup_min_sequence_diff,
            config.replication.catchup_threshold_percentage,
        ));
        let leader_term = Arc::new(AtomicI64::new(-1));
        let peers = Arc::new(RwLock::new(Vec::new()));
        let (fatal_tx, _) = watch::channel(false);

        let pipeline = ApplyPipeline::new(
            store.clone(),
            core.clone(),
            pending.clone(),
            catchup.clone(),
            snapshots,
            applied_index.clone(),
            leader_term.clone(),
            peers.clone(),
            config.replication.create_init_db_snapshot,
        );

        let fatal = fatal_tx.clone();
        let handle = tokio::spawn(async move {
            let result = pipeline.run(events).await;
            if let Err(e) = &result {
                error!(error = %e, "apply pipeline halted");
                let _ = fatal.send(true);
            }
            result
        });

        Ok(Arc::new(Self {
            node,
            core,
            store,
            pending,
            catchup,
            forwarder: Forwarder::new(config.server.api_uses_ssl, FORWARD_TIMEOUT)?,
            applied_index,
            leader_term,
            peers,
            shutting_down,
            pipeline: Mutex::new(Some(handle)),
            fatal_tx,
        }))
    }

    /// Watch channel that flips to `true` if the apply pipeline halts on a
    /// fatal error.
    pub fn fatal_watch(&self) -> watch::Receiver<bool> {
        self.fatal_tx.subscribe()
    }

    // -- Write path -----------------------------------------------------------

    /// Execute a client write: propose-and-wait on the leader, forward on
    /// a follower.
    pub async fn write(&self, op: StoreOperation) -> Result<WriteResponse, ReplicationError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ReplicationError::ShuttingDown);
        }
        validate(&op)?;

        if self.core.is_leader() {
            let result = self.propose_and_wait(&op).await;
            let status = if result.is_ok() { "ok" } else { "rejected" };
            counter!(WRITES_TOTAL, "status" => status).increment(1);
            return result.map(WriteResponse::Applied);
        }

        let leader = self.core.leader_hint().ok_or(ReplicationError::NoLeader)?;
        let peers = self.peers.read().expect("rwlock poisoned").clone();
        let url = self.forwarder.leader_url(&leader, &peers, "/write")?;
        let body = serde_json::to_string(&op)
            .map_err(|e| ReplicationError::InvalidRequest(e.to_string()))?;
        let relayed = self.forwarder.forward_write(&url, body).await?;
        Ok(WriteResponse::Forwarded {
            status: relayed.status,
            body: relayed.body,
        })
    }

    async fn propose_and_wait(
        &self,
        op: &StoreOperation,
    ) -> Result<ApplyResult, ReplicationError> {
        let data = serde_json::to_vec(op)
            .map_err(|e| ReplicationError::InvalidRequest(e.to_string()))?;

        let (op_id, handle) = self.pending.register();
        if let Err(e) = self.core.propose(data.into(), Some(op_id)) {
            self.pending.forget(op_id);
            return Err(e);
        }

        match handle.wait().await {
            WriteOutcome::Applied(result) => Ok(result),
            WriteOutcome::LeadershipLost => Err(ReplicationError::LeadershipLost),
            WriteOutcome::ShuttingDown => Err(ReplicationError::ShuttingDown),
            WriteOutcome::Failed(message) => {
                Err(ReplicationError::Internal(anyhow::anyhow!(message)))
            }
        }
    }

    // -- Read path ------------------------------------------------------------

    /// Read a key from the local store.  Served locally on any node;
    /// freshness is bounded by the catch-up gate.
    pub fn read(&self, key: &str) -> Result<Option<String>, ReplicationError> {
        self.store
            .get(key)
            .map_err(ReplicationError::Internal)
    }

    // -- Admin operations ------------------------------------------------------

    /// Replace the cluster membership from a fresh nodes string.
    pub fn refresh_nodes(&self, nodes: &str) -> Result<(), ReplicationError> {
        let peers = parse_nodes_config(nodes)?;
        if peers.is_empty() {
            return Err(ReplicationError::InvalidRequest(
                "nodes string resolves to an empty peer set".into(),
            ));
        }
        self.core.refresh_peers(peers)
    }

    /// Ask the consensus core to start an election.
    pub fn trigger_vote(&self) -> Result<(), ReplicationError> {
        self.core.trigger_vote()
    }

    /// Take an on-demand snapshot, optionally recording an external
    /// full-state override path in the manifest.  Resolves with the
    /// applied index the snapshot covers.  The override travels with this
    /// request only; concurrent triggers never pick it up.
    pub async fn do_snapshot(
        &self,
        ext_snapshot_path: Option<PathBuf>,
    ) -> Result<u64, ReplicationError> {
        if let Some(path) = &ext_snapshot_path {
            if !Path::new(path).exists() {
                return Err(ReplicationError::InvalidRequest(format!(
                    "external snapshot path does not exist: {}",
                    path.display()
                )));
            }
        }
        self.core.request_snapshot(ext_snapshot_path).await
    }

    // -- Introspection --------------------------------------------------------

    /// Whether this node has caught up enough to serve traffic.
    pub fn is_ready(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire) && self.catchup.is_caught_up()
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    /// Leader term while leading, `-1` otherwise.
    pub fn leader_term(&self) -> i64 {
        self.leader_term.load(Ordering::Acquire)
    }

    /// Whether the pipeline has observed a leader-start for this node that
    /// has not been followed by a step-down.
    pub fn has_leader_term(&self) -> bool {
        self.leader_term() >= 0
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn node_status(&self) -> NodeStatus {
        let state = if self.shutting_down.load(Ordering::Acquire) {
            "SHUTTING_DOWN"
        } else if self.has_leader_term() {
            "LEADER"
        } else {
            "FOLLOWER"
        };
        NodeStatus {
            state,
            term: self.leader_term(),
            committed_index: self.core.last_committed_index(),
            applied_index: self.applied_index(),
            ready: self.is_ready(),
            pending_writes: self.pending.len(),
            peers: self
                .peers
                .read()
                .expect("rwlock poisoned")
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    // -- Lifecycle -------------------------------------------------------------

    /// Begin shutdown: refuse new writes and stop the consensus core.  The
    /// core closing its event channel makes the pipeline drain in-flight
    /// writes with a shutting-down outcome.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            pending = self.pending.len(),
            "replication state shutting down"
        );
        self.core.shutdown();
    }

    /// Wait for the core and pipeline to finish.  Surfaces the pipeline's
    /// fatal error, if any.  Idempotent.
    pub async fn join(&self) -> Result<(), ReplicationError> {
        self.core.join().await;
        let handle = self.pipeline.lock().expect("mutex poisoned").take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(ReplicationError::Internal(anyhow::anyhow!(
                    "apply pipeline task panicked: {e}"
                ))),
            },
            None => Ok(()),
        }
    }
}

fn validate(op: &StoreOperation) -> Result<(), ReplicationError> {
    let key = match op {
        StoreOperation::Set { key, .. } => key,
        StoreOperation::Delete { key } => key,
        StoreOperation::NoOp => return Ok(()),
    };
    if key.is_empty() {
        return Err(ReplicationError::InvalidRequest(
            "key must not be empty".into(),
        ));
    }
    Ok(())
}

// -- Tests --------------------------------------------------------------------
