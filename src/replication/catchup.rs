//! Catch-up monitor.
//!
//! Tracks the gap between the locally applied sequence and the best known
//! cluster sequence, and derives the boolean readiness gate health checks
//! consume.  Readiness is recomputed on every applied entry and on every
//! leadership or configuration change; flips are immediate, with no
//! debounce, and the flag is never persisted.

use std::sync::atomic::{AtomicBool, Ordering};

use metrics::gauge;
use tracing::info;

use crate::metrics::READY;

/// Readiness gate derived from replication lag.
///
/// A node is caught up when the absolute gap is small
/// (`min_sequence_diff`) or when it has applied a large enough fraction of
/// the cluster sequence (`threshold_percentage`) -- the latter keeps large
/// clusters from flapping on proportionally tiny lag.
pub struct CatchUpMonitor {
    min_sequence_diff: u64,
    threshold_percentage: u64,
    caught_up: AtomicBool,
}

impl CatchUpMonitor {
    pub fn new(min_sequence_diff: u64, threshold_percentage: u64) -> Self {
        Self {
            min_sequence_diff,
            threshold_percentage,
            caught_up: AtomicBool::new(false),
        }
    }

    /// Recompute readiness from the local applied sequence and the best
    /// known cluster sequence.  Returns the new value.
    pub fn recompute(&self, local: u64, cluster: u64) -> bool {
        let ready = if cluster <= local {
            true
        } else {
            let gap = cluster - local;
            gap <= self.min_sequence_diff
                || local.saturating_mul(100) / cluster >= self.threshold_percentage
        };

        let was = self.caught_up.swap(ready, Ordering::AcqRel);
        if was != ready {
            info!(local, cluster, ready, "readiness changed");
        }
        gauge!(READY).set(if ready { 1.0 } else { 0.0 });
        ready
    }

    /// Current readiness value.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }
}

// -- Tests --------------------------------------------------------------------
