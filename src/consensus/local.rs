//! In-process single-node consensus core.
//!
//! `LocalConsensus` provides a real, durable [`ConsensusCore`] for
//! single-node clusters and tests: every proposal is appended to a
//! JSON-lines log under `log/` and committed immediately, the term is
//! persisted and bumped on every start (each restart is an election), and
//! entries above the loaded snapshot index are replayed as a committed
//! batch on open.
//!
//! Snapshot triggers fire on entry count (`snapshot_max_log_entries` new
//! entries since the last snapshot) and on a periodic timer
//! (`snapshot_interval_s`) -- in both cases only when new entries exist,
//! which is exactly the trigger behavior the configurable init-snapshot
//! dummy write works around.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};

use super::core::{CommittedEntry, ConsensusCore, ConsensusEvent, NodeIdentity, PeerAddr};
use crate::errors::ReplicationError;

/// Log file name under the log directory.
const ENTRIES_FILE: &str = "entries.jsonl";

/// Term file name under the log directory.
const TERM_FILE: &str = "term";

/// Tunables for the local core.
#[derive(Debug, Clone)]
pub struct LocalConsensusOptions {
    /// Periodic snapshot trigger interval.
    pub snapshot_interval_s: u64,
    /// Entry-count snapshot trigger threshold.
    pub snapshot_max_log_entries: u64,
}

impl Default for LocalConsensusOptions {
    fn default() -> Self {
        Self {
            snapshot_interval_s: 3600,
            snapshot_max_log_entries: 1000,
        }
    }
}

/// One durable log record.
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    index: u64,
    term: i64,
    data: Vec<u8>,
}

/// Append-side state kept under one mutex so index assignment and the
/// durable write happen atomically.
struct LogWriter {
    file: File,
    path: PathBuf,
}

/// Single-node [`ConsensusCore`] with a persisted log.
pub struct LocalConsensus {
    node: NodeIdentity,
    opts: LocalConsensusOptions,

    term: AtomicI64,
    last_index: AtomicU64,
    /// Index covered by the latest published snapshot; log entries at or
    /// below it have been compacted away.
    snapshot_index: AtomicU64,
    snapshot_in_flight: AtomicBool,
    shut_down: AtomicBool,

    peers: std::sync::RwLock<Vec<NodeIdentity>>,
    writer: Mutex<LogWriter>,
    events: Mutex<Option<mpsc::UnboundedSender<ConsensusEvent>>>,
    /// Poked by `propose` when the entry-count threshold is reached; the
    /// trigger task owns the actual snapshot round.
    snapshot_nudge: Notify,
    stopped_tx: watch::Sender<bool>,
}

impl LocalConsensus {
    /// Open the log at `log_dir`, replay entries with `index >= replay_from`
    /// as an initial committed batch, and become leader.
    ///
    /// Returns the core and the event receiver the apply pipeline consumes.
    pub fn open(
        node: NodeIdentity,
        log_dir: &Path,
        peers: Vec<NodeIdentity>,
        replay_from: u64,
        opts: LocalConsensusOptions,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ConsensusEvent>), ReplicationError> {
        std::fs::create_dir_all(log_dir)?;

        let term = load_term(log_dir)? + 1;
        std::fs::write(log_dir.join(TERM_FILE), term.to_string())?;

        let entries_path = log_dir.join(ENTRIES_FILE);
        let records = read_log(&entries_path)?;
        let last_index = records
            .last()
            .map(|r| r.index)
            .unwrap_or(0)
            .max(replay_from.saturating_sub(1));

        let replay: Vec<CommittedEntry> = records
            .into_iter()
            .filter(|r| r.index >= replay_from)
            .map(|r| CommittedEntry {
                index: r.index,
                term: r.term,
                data: Bytes::from(r.data),
                op_id: None,
            })
            .collect();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&entries_path)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stopped_tx, _) = watch::channel(false);

        let core = Arc::new(Self {
            node,
            opts,
            term: AtomicI64::new(term),
            last_index: AtomicU64::new(last_index),
            snapshot_index: AtomicU64::new(replay_from.saturating_sub(1)),
            snapshot_in_flight: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            peers: std::sync::RwLock::new(peers.clone()),
            writer: Mutex::new(LogWriter {
                file,
                path: entries_path,
            }),
            events: Mutex::new(Some(events_tx)),
            snapshot_nudge: Notify::new(),
            stopped_tx,
        });

        if !replay.is_empty() {
            info!(
                entries = replay.len(),
                from = replay_from,
                "replaying log tail after snapshot"
            );
            core.emit(ConsensusEvent::Committed(replay))?;
        }
        core.emit(ConsensusEvent::ConfigurationCommitted { peers })?;
        core.emit(ConsensusEvent::LeaderStart { term })?;
        info!(term, last_index, "local consensus core started as leader");

        core.clone().spawn_trigger_task();

        Ok((core, events_rx))
    }

    fn emit(&self, event: ConsensusEvent) -> Result<(), ReplicationError> {
        let events = self.events.lock().expect("mutex poisoned");
        match events.as_ref() {
            Some(tx) => tx.send(event).map_err(|_| ReplicationError::ShuttingDown),
            None => Err(ReplicationError::ShuttingDown),
        }
    }

    /// Entries appended since the latest published snapshot.
    fn entries_since_snapshot(&self) -> u64 {
        self.last_index
            .load(Ordering::Acquire)
            .saturating_sub(self.snapshot_index.load(Ordering::Acquire))
    }

    /// Emit a snapshot request, wait for the coordinator's answer, and
    /// compact the log once it succeeds.
    async fn snapshot_round(
        &self,
        ext_snapshot_path: Option<PathBuf>,
    ) -> Result<u64, ReplicationError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ReplicationError::ShuttingDown);
        }
        if self.snapshot_in_flight.swap(true, Ordering::AcqRel) {
            return Err(ReplicationError::Snapshot(
                "a snapshot is already in progress".into(),
            ));
        }

        let (done_tx, done_rx) = oneshot::channel();
        let result = match self.emit(ConsensusEvent::SnapshotRequested {
            ext_snapshot_path,
            done: done_tx,
        }) {
            Ok(()) => match done_rx.await {
                Ok(Ok(index)) => {
                    if let Err(e) = self.compact(index) {
                        warn!(error = %e, "log compaction after snapshot failed");
                    }
                    self.snapshot_index.store(index, Ordering::Release);
                    Ok(index)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ReplicationError::ShuttingDown),
            },
            Err(e) => Err(e),
        };
        self.snapshot_in_flight.store(false, Ordering::Release);
        result
    }

    /// Rewrite the log keeping only entries above `up_to`.
    fn compact(&self, up_to: u64) -> Result<(), ReplicationError> {
        let mut writer = self.writer.lock().expect("mutex poisoned");
        let records = read_log(&writer.path)?;
        let keep: Vec<&LogRecord> = records.iter().filter(|r| r.index > up_to).collect();

        let tmp_path = writer.path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in &keep {
                serde_json::to_writer(&mut tmp, record)
                    .map_err(|e| ReplicationError::Snapshot(e.to_string()))?;
                tmp.write_all(b"\n")?;
            }
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, &writer.path)?;

        writer.file = OpenOptions::new().append(true).open(&writer.path)?;
        debug!(up_to, kept = keep.len(), "compacted consensus log");
        Ok(())
    }

    /// Background task driving both snapshot heuristics.  Owns the only
    /// long-lived strong reference besides the replication state, so it
    /// exits promptly on shutdown.
    fn spawn_trigger_task(self: Arc<Self>) {
        let interval = Duration::from_secs(self.opts.snapshot_interval_s.max(1));
        let mut stopped = self.stopped_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.snapshot_nudge.notified() => {}
                    _ = stopped.wait_for(|v| *v) => break,
                }
                if self.shut_down.load(Ordering::Acquire) {
                    break;
                }
                // Entry-count insensitivity: idle nodes never snapshot here.
                if self.entries_since_snapshot() == 0 {
                    continue;
                }
                if let Err(e) = self.snapshot_round(None).await {
                    warn!(error = %e, "snapshot trigger failed");
                }
            }
        });
    }
}

impl ConsensusCore for LocalConsensus {
    fn propose(&self, data: Bytes, op_id: Option<u64>) -> Result<(), ReplicationError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ReplicationError::ShuttingDown);
        }

        let term = self.term.load(Ordering::Acquire);
        {
            let mut writer = self.writer.lock().expect("mutex poisoned");
            let index = self.last_index.load(Ordering::Acquire) + 1;
            let record = LogRecord {
                index,
                term,
                data: data.to_vec(),
            };
            serde_json::to_writer(&mut writer.file, &record)
                .map_err(|e| ReplicationError::ProposalRejected(e.to_string()))?;
            writer.file.write_all(b"\n")?;
            writer.file.sync_data()?;
            self.last_index.store(index, Ordering::Release);
            // Emit while still holding the writer lock: a concurrent
            // proposer must not get its later entry onto the event channel
            // first, or the pipeline would see a commit-order gap.
            self.emit(ConsensusEvent::Committed(vec![CommittedEntry {
                index,
                term,
                data,
                op_id,
            }]))?;
        }

        if self.entries_since_snapshot() >= self.opts.snapshot_max_log_entries {
            self.snapshot_nudge.notify_one();
        }

        Ok(())
    }

    fn is_leader(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire)
    }

    fn term(&self) -> i64 {
        if self.is_leader() {
            self.term.load(Ordering::Acquire)
        } else {
            -1
        }
    }

    fn leader_hint(&self) -> Option<PeerAddr> {
        if self.is_leader() {
            Some(self.node.peering_addr())
        } else {
            None
        }
    }

    fn last_committed_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    fn refresh_peers(&self, peers: Vec<NodeIdentity>) -> Result<(), ReplicationError> {
        info!(count = peers.len(), "committing refreshed peer configuration");
        *self.peers.write().expect("rwlock poisoned") = peers.clone();
        self.emit(ConsensusEvent::ConfigurationCommitted { peers })
    }

    fn trigger_vote(&self) -> Result<(), ReplicationError> {
        // Single-node core: this node is always the elected leader.
        info!("vote triggered; single-node core remains leader");
        Ok(())
    }

    fn request_snapshot(
        &self,
        ext_snapshot_path: Option<PathBuf>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ReplicationError>> + Send + '_>> {
        Box::pin(self.snapshot_round(ext_snapshot_path))
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("local consensus core shutting down");
        // Dropping the sender closes the event channel, which is the
        // apply pipeline's signal to drain and exit.
        self.events.lock().expect("mutex poisoned").take();
        let _ = self.stopped_tx.send(true);
    }

    fn join(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let mut stopped = self.stopped_tx.subscribe();
        Box::pin(async move {
            let _ = stopped.wait_for(|v| *v).await;
        })
    }
}

fn load_term(log_dir: &Path) -> Result<i64, ReplicationError> {
    let path = log_dir.join(TERM_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let contents = std::fs::read_to_string(&path)?;
    contents
        .trim()
        .parse()
        .map_err(|_| ReplicationError::Config(format!("corrupt term file at {}", path.display())))
}

fn read_log(path: &Path) -> Result<Vec<LogRecord>, ReplicationError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = serde_json::from_str(&line).map_err(|e| {
            ReplicationError::Config(format!(
                "corrupt log record at {}:{}: {e}",
                path.display(),
                lineno + 1
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> NodeIdentity {
        NodeIdentity {
            host: "127.0.0.1".into(),
            peering_port: 8107,
            api_port: 8108,
        }
    }

    fn open(
        dir: &Path,
        replay_from: u64,
        opts: LocalConsensusOptions,
    ) -> (Arc<LocalConsensus>, mpsc::UnboundedReceiver<ConsensusEvent>) {
        LocalConsensus::open(test_node(), dir, vec![test_node()], replay_from, opts).unwrap()
    }

    /// Drain the three startup events (optional replay batch, config, leader
    /// start), returning any replayed entries.
    async fn drain_startup(
        rx: &mut mpsc::UnboundedReceiver<ConsensusEvent>,
    ) -> Vec<CommittedEntry> {
        let mut replay = Vec::new();
        loop {
            match rx.recv().await.expect("startup events") {
                ConsensusEvent::Committed(batch) => replay.extend(batch),
                ConsensusEvent::ConfigurationCommitted { .. } => {}
                ConsensusEvent::LeaderStart { .. } => return replay,
                other => panic!("unexpected startup event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_propose_commits_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (core, mut rx) = open(dir.path(), 1, LocalConsensusOptions::default());
        drain_startup(&mut rx).await;

        core.propose(Bytes::from_static(b"{\"op\":\"NO_OP\"}"), Some(42))
            .unwrap();
        core.propose(Bytes::from_static(b"{\"op\":\"NO_OP\"}"), None)
            .unwrap();

        match rx.recv().await.unwrap() {
            ConsensusEvent::Committed(batch) => {
                assert_eq!(batch[0].index, 1);
                assert_eq!(batch[0].op_id, Some(42));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ConsensusEvent::Committed(batch) => {
                assert_eq!(batch[0].index, 2);
                assert_eq!(batch[0].op_id, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(core.last_committed_index(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_proposers_commit_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        // Keep the entry-count trigger out of the way for this test.
        let opts = LocalConsensusOptions {
            snapshot_interval_s: 3600,
            snapshot_max_log_entries: u64::MAX,
        };
        let (core, mut rx) = open(dir.path(), 1, opts);
        drain_startup(&mut rx).await;

        let threads: u64 = 8;
        let per_thread: u64 = 200;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let core = core.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        core.propose(Bytes::from_static(b"{\"op\":\"NO_OP\"}"), None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut next = 1;
        while next <= threads * per_thread {
            match rx.recv().await.unwrap() {
                ConsensusEvent::Committed(batch) => {
                    for entry in batch {
                        assert_eq!(entry.index, next, "entries must arrive in log order");
                        next += 1;
                    }
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(core.last_committed_index(), threads * per_thread);
    }

    #[tokio::test]
    async fn test_restart_replays_tail_and_bumps_term() {
        let dir = tempfile::tempdir().unwrap();
        let first_term;
        {
            let (core, mut rx) = open(dir.path(), 1, LocalConsensusOptions::default());
            drain_startup(&mut rx).await;
            first_term = core.term();
            for _ in 0..3 {
                core.propose(Bytes::from_static(b"{\"op\":\"NO_OP\"}"), None)
                    .unwrap();
            }
            core.shutdown();
            core.join().await;
        }

        // Restart with a snapshot covering index 1: entries 2 and 3 replay.
        let (core, mut rx) = open(dir.path(), 2, LocalConsensusOptions::default());
        let replay = drain_startup(&mut rx).await;
        assert_eq!(
            replay.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(replay.iter().all(|e| e.op_id.is_none()));
        assert_eq!(core.term(), first_term + 1);
        assert_eq!(core.last_committed_index(), 3);
    }

    #[tokio::test]
    async fn test_entry_count_trigger_and_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let opts = LocalConsensusOptions {
            snapshot_interval_s: 3600,
            snapshot_max_log_entries: 2,
        };
        let (core, mut rx) = open(dir.path(), 1, opts);
        drain_startup(&mut rx).await;

        core.propose(Bytes::from_static(b"{\"op\":\"NO_OP\"}"), None)
            .unwrap();
        core.propose(Bytes::from_static(b"{\"op\":\"NO_OP\"}"), None)
            .unwrap();

        // Two committed events, then the trigger task asks for a snapshot.
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                ConsensusEvent::Committed(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        match rx.recv().await.unwrap() {
            ConsensusEvent::SnapshotRequested {
                ext_snapshot_path,
                done,
            } => {
                assert!(ext_snapshot_path.is_none());
                done.send(Ok(2)).unwrap();
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Wait for compaction to settle, then verify the tail is empty.
        tokio::time::sleep(Duration::from_millis(50)).await;
        core.shutdown();
        core.join().await;

        let (_core2, mut rx2) = open(dir.path(), 3, LocalConsensusOptions::default());
        let replay = drain_startup(&mut rx2).await;
        assert!(replay.is_empty(), "log should be compacted up to index 2");
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel_and_rejects_proposals() {
        let dir = tempfile::tempdir().unwrap();
        let (core, mut rx) = open(dir.path(), 1, LocalConsensusOptions::default());
        drain_startup(&mut rx).await;

        core.shutdown();
        core.join().await;
        assert!(!core.is_leader());
        assert_eq!(core.term(), -1);
        assert!(core.leader_hint().is_none());
        assert!(matches!(
            core.propose(Bytes::new(), None),
            Err(ReplicationError::ShuttingDown)
        ));
        assert!(rx.recv().await.is_none(), "event channel should be closed");

        // join is idempotent.
        core.join().await;
    }

    #[tokio::test]
    async fn test_on_demand_snapshot_round() {
        let dir = tempfile::tempdir().unwrap();
        let (core, mut rx) = open(dir.path(), 1, LocalConsensusOptions::default());
        drain_startup(&mut rx).await;

        core.propose(Bytes::from_static(b"{\"op\":\"NO_OP\"}"), None)
            .unwrap();
        let _ = rx.recv().await.unwrap();

        let core2 = core.clone();
        let answer = tokio::spawn(async move {
            match rx.recv().await.unwrap() {
                ConsensusEvent::SnapshotRequested { done, .. } => {
                    done.send(Ok(1)).unwrap();
                }
                other => panic!("unexpected event: {other:?}"),
            }
            rx
        });

        let index = core2.request_snapshot(None).await.unwrap();
        assert_eq!(index, 1);
        answer.await.unwrap();
    }
}
