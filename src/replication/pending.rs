//! In-flight write tracking.
//!
//! Every accepted write registers a [`CompletionHandle`] before it is
//! proposed.  The apply pipeline resolves the handle when the matching
//! entry commits; shutdown and leadership loss drain the whole registry so
//! no caller is ever left waiting.  Each operation gets its own oneshot
//! channel, so any number of writes can be in flight concurrently and each
//! is resolved exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::store::engine::ApplyResult;

/// Final outcome of one pending write.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// The entry committed and was applied to the store.
    Applied(ApplyResult),
    /// Leadership was lost before the entry committed.
    LeadershipLost,
    /// The node shut down before the entry committed.
    ShuttingDown,
    /// The entry committed but applying it failed (the node is halting).
    Failed(String),
}

/// Receiving side of one pending operation.
pub struct CompletionHandle {
    rx: oneshot::Receiver<WriteOutcome>,
}

impl CompletionHandle {
    /// Wait for the operation to resolve.  A dropped sender (only possible
    /// during teardown races) counts as shutdown.
    pub async fn wait(self) -> WriteOutcome {
        self.rx.await.unwrap_or(WriteOutcome::ShuttingDown)
    }
}

/// Registry of pending operations, keyed by a process-local op id.
#[derive(Default)]
pub struct PendingOps {
    next_id: AtomicU64,
    inflight: Mutex<HashMap<u64, oneshot::Sender<WriteOutcome>>>,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending operation; returns its id and the handle the
    /// caller blocks on.
    pub fn register(&self) -> (u64, CompletionHandle) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inflight
            .lock()
            .expect("mutex poisoned")
            .insert(id, tx);
        (id, CompletionHandle { rx })
    }

    /// Resolve one operation.  Returns false if the id is unknown (already
    /// resolved, drained, or a replayed entry from before this process).
    pub fn resolve(&self, id: u64, outcome: WriteOutcome) -> bool {
        let tx = self.inflight.lock().expect("mutex poisoned").remove(&id);
        match tx {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Remove a registration without firing it (proposal never reached the
    /// consensus core).
    pub fn forget(&self, id: u64) {
        self.inflight.lock().expect("mutex poisoned").remove(&id);
    }

    /// Resolve every pending operation with `outcome`.
    pub fn drain(&self, outcome: WriteOutcome) {
        let drained: Vec<_> = {
            let mut inflight = self.inflight.lock().expect("mutex poisoned");
            inflight.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(outcome.clone());
        }
    }

    /// Number of operations currently awaiting commit.
    pub fn len(&self) -> usize {
        self.inflight.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -- Tests --------------------------------------------------------------------
