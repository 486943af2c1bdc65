//! The apply pipeline.
//!
//! A single task consumes the consensus event channel and is the only
//! writer to the store, so committed entries are applied strictly in log
//! order.  Ordering violations and apply failures are fatal: a replica
//! that skipped or mangled a committed entry would silently diverge from
//! its peers, so the pipeline halts the node instead.
//!
//! The channel closing is the shutdown signal; the pipeline drains every
//! in-flight write before returning so no caller is left waiting.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::consensus::core::{CommittedEntry, ConsensusCore, ConsensusEvent, NodeIdentity};
use crate::errors::ReplicationError;
use crate::metrics::{APPLIED_ENTRIES_TOTAL, APPLIED_INDEX, LEADER_TERM};
use crate::replication::catchup::CatchUpMonitor;
use crate::replication::pending::{PendingOps, WriteOutcome};
use crate::replication::snapshot::SnapshotCoordinator;
use crate::store::engine::{StoreEngine, StoreOperation};

/// State shared by the apply pipeline and the rest of the replication
/// layer.
pub struct ApplyPipeline {
    store: Arc<dyn StoreEngine>,
    core: Arc<dyn ConsensusCore>,
    pending: Arc<PendingOps>,
    catchup: Arc<CatchUpMonitor>,
    snapshots: Arc<SnapshotCoordinator>,
    applied_index: Arc<AtomicU64>,
    leader_term: Arc<AtomicI64>,
    peers: Arc<RwLock<Vec<NodeIdentity>>>,
    /// Propose a no-op right after winning leadership.  A fresh leader with
    /// an empty log otherwise never trips entry-count snapshot triggers.
    noop_on_leader_start: bool,
}

impl ApplyPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StoreEngine>,
        core: Arc<dyn ConsensusCore>,
        pending: Arc<PendingOps>,
        catchup: Arc<CatchUpMonitor>,
        snapshots: Arc<SnapshotCoordinator>,
        applied_index: Arc<AtomicU64>,
        leader_term: Arc<AtomicI64>,
        peers: Arc<RwLock<Vec<NodeIdentity>>>,
        noop_on_leader_start: bool,
    ) -> Self {
        Self {
            store,
            core,
            pending,
            catchup,
            snapshots,
            applied_index,
            leader_term,
            peers,
            noop_on_leader_start,
        }
    }

    /// Consume consensus events until the channel closes (clean shutdown)
    /// or a fatal apply error halts the node.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ConsensusEvent>,
    ) -> Result<(), ReplicationError> {
        while let Some(event) = events.recv().await {
            match event {
                ConsensusEvent::Committed(batch) => {
                    if let Err(e) = self.apply_batch(batch) {
                        // Halting: nothing pending will ever commit here.
                        self.pending.drain(WriteOutcome::Failed(e.to_string()));
                        return Err(e);
                    }
                }
                ConsensusEvent::LeaderStart { term } => self.on_leader_start(term),
                ConsensusEvent::LeaderStop { reason } => self.on_leader_stop(&reason),
                ConsensusEvent::ConfigurationCommitted { peers } => {
                    info!(peers = peers.len(), "peer set committed");
                    *self.peers.write().expect("rwlock poisoned") = peers;
                    self.recompute_catchup();
                }
                ConsensusEvent::SnapshotRequested {
                    ext_snapshot_path,
                    done,
                } => {
                    self.snapshots.spawn_save(ext_snapshot_path, done);
                }
                ConsensusEvent::Error { message } => {
                    warn!(message, "consensus core reported an error");
                }
            }
        }

        debug!("consensus event channel closed; apply pipeline stopping");
        self.pending.drain(WriteOutcome::ShuttingDown);
        Ok(())
    }

    fn apply_batch(&self, batch: Vec<CommittedEntry>) -> Result<(), ReplicationError> {
        for entry in batch {
            self.apply_entry(entry)?;
        }
        Ok(())
    }

    fn apply_entry(&self, entry: CommittedEntry) -> Result<(), ReplicationError> {
        let applied = self.applied_index.load(Ordering::Acquire);
        if entry.index != applied + 1 {
            return Err(ReplicationError::Apply {
                index: entry.index,
                message: format!(
                    "commit order violated: expected index {}, got {}",
                    applied + 1,
                    entry.index
                ),
            });
        }

        // A checkpoint may have raced slightly ahead of the manifest's
        // applied index; entries already contained in it are replayed by
        // the log but must not hit the store twice.
        let already_applied =
            entry.op_id.is_none() && entry.index <= self.store.current_sequence();

        let result = if already_applied {
            debug!(index = entry.index, "entry already present in checkpoint");
            Default::default()
        } else {
            let op: StoreOperation = serde_json::from_slice(&entry.data).map_err(|e| {
                ReplicationError::Apply {
                    index: entry.index,
                    message: format!("undecodable entry payload: {e}"),
                }
            })?;
            self.store
                .apply(&op)
                .map_err(|e| ReplicationError::Apply {
                    index: entry.index,
                    message: e.to_string(),
                })?
        };

        self.applied_index.store(entry.index, Ordering::Release);
        counter!(APPLIED_ENTRIES_TOTAL).increment(1);
        gauge!(APPLIED_INDEX).set(entry.index as f64);

        if let Some(op_id) = entry.op_id {
            self.pending.resolve(op_id, WriteOutcome::Applied(result));
        }
        // Readiness tracks every applied entry, not just batch boundaries,
        // so a long replay batch flips the gate as soon as the node is
        // close enough.
        self.recompute_catchup();
        Ok(())
    }

    fn on_leader_start(&self, term: i64) {
        info!(term, "this node became leader");
        self.leader_term.store(term, Ordering::Release);
        gauge!(LEADER_TERM).set(term as f64);
        self.recompute_catchup();

        if self.noop_on_leader_start {
            match serde_json::to_vec(&StoreOperation::NoOp) {
                Ok(data) => {
                    if let Err(e) = self.core.propose(data.into(), None) {
                        warn!(error = %e, "no-op proposal after leader start failed");
                    }
                }
                Err(e) => warn!(error = %e, "could not encode no-op operation"),
            }
        }
    }

    fn on_leader_stop(&self, reason: &str) {
        info!(reason, "this node stepped down");
        self.leader_term.store(-1, Ordering::Release);
        gauge!(LEADER_TERM).set(-1.0);
        // Entries proposed here may still commit under the new leader, but
        // this process can no longer learn their outcome.
        self.pending.drain(WriteOutcome::LeadershipLost);
        self.recompute_catchup();
    }

    fn recompute_catchup(&self) {
        let local = self.applied_index.load(Ordering::Acquire);
        let cluster = self.core.last_committed_index();
        self.catchup.recompute(local, cluster);
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::core::PeerAddr;
    use crate::store::memory::MemoryStore;
    use bytes::Bytes;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// Core double: records proposals, reports a configurable committed
    /// index and counts how often it is consulted.
    #[derive(Default)]
    struct StubCore {
        proposals: Mutex<Vec<(Bytes, Option<u64>)>>,
        committed: AtomicU64,
        committed_index_calls: AtomicU64,
    }

    impl ConsensusCore for StubCore {
        fn propose(&self, data: Bytes, op_id: Option<u64>) -> Result<(), ReplicationError> {
            self.proposals
                .lock()
                .unwrap()
                .push((data, op_id));
            Ok(())
        }
        fn is_leader(&self) -> bool {
            true
        }
        fn term(&self) -> i64 {
            1
        }
        fn leader_hint(&self) -> Option<PeerAddr> {
            None
        }
        fn last_committed_index(&self) -> u64 {
            self.committed_index_calls.fetch_add(1, Ordering::Relaxed);
            self.committed.load(Ordering::Acquire)
        }
        fn refresh_peers(&self, _: Vec<NodeIdentity>) -> Result<(), ReplicationError> {
            Ok(())
        }
        fn trigger_vote(&self) -> Result<(), ReplicationError> {
            Ok(())
        }
        fn request_snapshot(
            &self,
            _: Option<std::path::PathBuf>,
        ) -> Pin<Box<dyn Future<Output = Result<u64, ReplicationError>> + Send + '_>> {
            Box::pin(async { Ok(0) })
        }
        fn shutdown(&self) {}
        fn join(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        core: Arc<StubCore>,
        pending: Arc<PendingOps>,
        applied_index: Arc<AtomicU64>,
        leader_term: Arc<AtomicI64>,
        peers: Arc<RwLock<Vec<NodeIdentity>>>,
        _root: tempfile::TempDir,
    }

    fn pipeline(noop_on_leader_start: bool) -> (ApplyPipeline, Harness) {
        let root = tempfile::tempdir().unwrap();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let core = Arc::new(StubCore::default());
        let pending = Arc::new(PendingOps::new());
        let applied_index = Arc::new(AtomicU64::new(0));
        let leader_term = Arc::new(AtomicI64::new(-1));
        let peers = Arc::new(RwLock::new(Vec::new()));
        let snapshots = Arc::new(SnapshotCoordinator::new(
            root.path(),
            store.clone(),
            applied_index.clone(),
            Arc::new(AtomicBool::new(false)),
        ));
        let pipeline = ApplyPipeline::new(
            store.clone(),
            core.clone(),
            pending.clone(),
            Arc::new(CatchUpMonitor::new(0, 95)),
            snapshots,
            applied_index.clone(),
            leader_term.clone(),
            peers.clone(),
            noop_on_leader_start,
        );
        (
            pipeline,
            Harness {
                store,
                core,
                pending,
                applied_index,
                leader_term,
                peers,
                _root: root,
            },
        )
    }

    fn entry(index: u64, op: &StoreOperation, op_id: Option<u64>) -> CommittedEntry {
        CommittedEntry {
            index,
            term: 1,
            data: serde_json::to_vec(op).unwrap().into(),
            op_id,
        }
    }

    fn set(key: &str, value: &str) -> StoreOperation {
        StoreOperation::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_applies_in_order_and_resolves_pending() {
        let (pipeline, h) = pipeline(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let (op_id, handle) = h.pending.register();

        tx.send(ConsensusEvent::Committed(vec![
            entry(1, &set("a", "1"), None),
            entry(2, &set("b", "2"), Some(op_id)),
        ]))
        .unwrap();
        drop(tx);

        pipeline.run(rx).await.unwrap();
        assert!(matches!(handle.wait().await, WriteOutcome::Applied(_)));
        assert_eq!(h.applied_index.load(Ordering::Acquire), 2);
        assert_eq!(h.store.get("b").unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_readiness_recomputed_for_each_applied_entry() {
        let (pipeline, h) = pipeline(false);
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(ConsensusEvent::Committed(vec![
            entry(1, &set("a", "1"), None),
            entry(2, &set("b", "2"), None),
            entry(3, &set("c", "3"), None),
        ]))
        .unwrap();
        drop(tx);

        pipeline.run(rx).await.unwrap();
        // One recomputation per entry, each reading the cluster's committed
        // index, so readiness can flip mid-batch during replay.
        assert_eq!(h.core.committed_index_calls.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn test_order_violation_is_fatal() {
        let (pipeline, h) = pipeline(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let (op_id, handle) = h.pending.register();

        // Index 3 with nothing applied yet: a gap.
        tx.send(ConsensusEvent::Committed(vec![entry(
            3,
            &set("a", "1"),
            Some(op_id),
        )]))
        .unwrap();

        let err = pipeline.run(rx).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Apply { index: 3, .. }));
        assert!(matches!(handle.wait().await, WriteOutcome::Failed(_)));
        assert_eq!(h.store.get("a").unwrap(), None);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_fatal() {
        let (pipeline, _h) = pipeline(false);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ConsensusEvent::Committed(vec![CommittedEntry {
            index: 1,
            term: 1,
            data: Bytes::from_static(b"garbage"),
            op_id: None,
        }]))
        .unwrap();

        let err = pipeline.run(rx).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_checkpoint_overlap_entries_are_not_reapplied() {
        let (pipeline, h) = pipeline(false);
        // Store already holds entry 1 (from a checkpoint taken just after
        // the manifest index was recorded).
        h.store.apply(&set("a", "checkpointed")).unwrap();
        assert_eq!(h.store.current_sequence(), 1);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ConsensusEvent::Committed(vec![
            entry(1, &set("a", "replayed"), None),
            entry(2, &set("b", "2"), None),
        ]))
        .unwrap();
        drop(tx);

        pipeline.run(rx).await.unwrap();
        // The replayed copy of entry 1 must not clobber checkpoint state.
        assert_eq!(h.store.get("a").unwrap().as_deref(), Some("checkpointed"));
        assert_eq!(h.store.get("b").unwrap().as_deref(), Some("2"));
        assert_eq!(h.applied_index.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn test_leadership_cycle_updates_term_and_drains() {
        let (pipeline, h) = pipeline(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_, handle) = h.pending.register();

        tx.send(ConsensusEvent::LeaderStart { term: 4 }).unwrap();
        tx.send(ConsensusEvent::LeaderStop {
            reason: "higher term observed".into(),
        })
        .unwrap();
        drop(tx);

        pipeline.run(rx).await.unwrap();
        assert_eq!(h.leader_term.load(Ordering::Acquire), -1);
        assert!(matches!(handle.wait().await, WriteOutcome::LeadershipLost));
    }

    #[tokio::test]
    async fn test_noop_proposed_on_leader_start_when_enabled() {
        let (pipeline, h) = pipeline(true);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ConsensusEvent::LeaderStart { term: 1 }).unwrap();
        drop(tx);

        pipeline.run(rx).await.unwrap();
        let proposals = h.core.proposals.lock().unwrap();
        assert_eq!(proposals.len(), 1);
        let op: StoreOperation = serde_json::from_slice(&proposals[0].0).unwrap();
        assert!(matches!(op, StoreOperation::NoOp));
    }

    #[tokio::test]
    async fn test_configuration_commit_replaces_peers() {
        let (pipeline, h) = pipeline(false);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ConsensusEvent::ConfigurationCommitted {
            peers: vec![NodeIdentity::parse("a:8107:8108").unwrap()],
        })
        .unwrap();
        drop(tx);

        pipeline.run(rx).await.unwrap();
        assert_eq!(h.peers.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_close_drains_with_shutdown() {
        let (pipeline, h) = pipeline(false);
        let (tx, rx) = mpsc::unbounded_channel::<ConsensusEvent>();
        let (_, handle) = h.pending.register();
        drop(tx);

        pipeline.run(rx).await.unwrap();
        assert!(matches!(handle.wait().await, WriteOutcome::ShuttingDown));
    }
}
