//! Snapshot coordinator.
//!
//! Owns the `snapshot/` and `meta/` directories under the replication
//! root.  A save checkpoints the store into a staging directory, writes a
//! small manifest (applied index, creation time, optional external
//! override path), then publishes atomically: the staging directory is
//! renamed into place and the `CURRENT` pointer file is rewritten via
//! temp-file + rename, so `CURRENT` never references a partial snapshot.
//! Superseded snapshot directories are pruned after publish.
//!
//! The store checkpoint runs under `spawn_blocking` so a slow engine never
//! blocks the apply pipeline; the shutdown flag is checked at the natural
//! boundaries (before checkpointing, before publishing) and a cancelled
//! save removes its staging directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::consensus::core::SnapshotDone;
use crate::errors::ReplicationError;
use crate::metrics::SNAPSHOTS_TOTAL;
use crate::store::engine::StoreEngine;

/// Subdirectory names under the replication data root.
pub const LOG_DIR_NAME: &str = "log";
pub const META_DIR_NAME: &str = "meta";
pub const SNAPSHOT_DIR_NAME: &str = "snapshot";

/// Store checkpoint directory inside one snapshot.
const DB_SNAPSHOT_NAME: &str = "db_snapshot";

/// Manifest file inside one snapshot.
const MANIFEST_NAME: &str = "manifest.json";

/// Pointer file naming the authoritative snapshot directory.
const CURRENT_NAME: &str = "CURRENT";

/// Marker recording that at least one snapshot has been published.  Before
/// the first publish a restart legitimately finds no snapshot and replays
/// the whole log; after it, a missing snapshot means lost data.
const INIT_MARKER_NAME: &str = "INITIALIZED";

/// Metadata recorded alongside every store checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Applied log index at the time the snapshot was triggered.
    pub applied_index: u64,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Externally supplied full-state override; preferred on load when it
    /// exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext_snapshot_path: Option<PathBuf>,
}

/// Coordinates snapshot save and load against the store.
pub struct SnapshotCoordinator {
    root: PathBuf,
    store: Arc<dyn StoreEngine>,
    applied_index: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl SnapshotCoordinator {
    pub fn new(
        root: &Path,
        store: Arc<dyn StoreEngine>,
        applied_index: Arc<AtomicU64>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            store,
            applied_index,
            shutdown,
        }
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIR_NAME)
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR_NAME)
    }

    /// Take and publish a snapshot; returns the applied index it covers.
    ///
    /// `ext_snapshot_path` travels with the individual request, so only the
    /// snapshot it was asked for records it in its manifest.
    pub async fn save(
        &self,
        ext_snapshot_path: Option<PathBuf>,
    ) -> Result<u64, ReplicationError> {
        match self.save_inner(ext_snapshot_path).await {
            Ok(index) => {
                counter!(SNAPSHOTS_TOTAL, "status" => "success").increment(1);
                info!(applied_index = index, "snapshot published");
                Ok(index)
            }
            Err(e) => {
                counter!(SNAPSHOTS_TOTAL, "status" => "failure").increment(1);
                warn!(error = %e, "snapshot save failed");
                Err(e)
            }
        }
    }

    async fn save_inner(
        &self,
        ext_snapshot_path: Option<PathBuf>,
    ) -> Result<u64, ReplicationError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ReplicationError::ShuttingDown);
        }

        let applied = self.applied_index.load(Ordering::Acquire);
        let snapshot_dir = self.snapshot_dir();
        std::fs::create_dir_all(&snapshot_dir)?;

        let suffix: [u8; 4] = rand::random();
        let staging = snapshot_dir.join(format!(".tmp-{applied}-{}", hex::encode(suffix)));

        let checkpoint_result = {
            let store = self.store.clone();
            let shutdown = self.shutdown.clone();
            let staging = staging.clone();
            let manifest = SnapshotManifest {
                applied_index: applied,
                created_at: chrono::Utc::now().to_rfc3339(),
                ext_snapshot_path,
            };
            tokio::task::spawn_blocking(move || -> Result<(), ReplicationError> {
                if shutdown.load(Ordering::Acquire) {
                    return Err(ReplicationError::ShuttingDown);
                }
                std::fs::create_dir_all(&staging)?;
                store
                    .checkpoint(&staging.join(DB_SNAPSHOT_NAME))
                    .map_err(|e| ReplicationError::Snapshot(e.to_string()))?;
                let serialized = serde_json::to_vec_pretty(&manifest)
                    .map_err(|e| ReplicationError::Snapshot(e.to_string()))?;
                std::fs::write(staging.join(MANIFEST_NAME), serialized)?;
                if shutdown.load(Ordering::Acquire) {
                    return Err(ReplicationError::ShuttingDown);
                }
                Ok(())
            })
            .await
            .map_err(|e| ReplicationError::Snapshot(format!("checkpoint task panicked: {e}")))?
        };

        if let Err(e) = checkpoint_result {
            if let Err(cleanup) = remove_if_exists(&staging) {
                warn!(error = %cleanup, "failed to remove partial snapshot staging dir");
            }
            return Err(e);
        }

        // Publish: rename the staging dir into place, then swing CURRENT.
        let final_name = format!("snapshot-{applied}");
        let final_dir = snapshot_dir.join(&final_name);
        remove_if_exists(&final_dir)?;
        std::fs::rename(&staging, &final_dir)?;

        let current_tmp = snapshot_dir.join(format!("{CURRENT_NAME}.tmp"));
        std::fs::write(&current_tmp, &final_name)?;
        std::fs::rename(&current_tmp, snapshot_dir.join(CURRENT_NAME))?;

        // From here on a start without a snapshot is data loss, not a
        // fresh node.
        let marker = self.meta_dir().join(INIT_MARKER_NAME);
        if !marker.exists() {
            std::fs::create_dir_all(self.meta_dir())?;
            std::fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
        }

        self.prune(&snapshot_dir, &final_name);
        Ok(applied)
    }

    /// Drive one save on a detached task and answer the trigger's
    /// completion channel.  Used by the apply pipeline so snapshot work
    /// never blocks commit-order processing.
    pub fn spawn_save(self: &Arc<Self>, ext_snapshot_path: Option<PathBuf>, done: SnapshotDone) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let result = coordinator.save(ext_snapshot_path).await;
            // The trigger may have given up (e.g. core shut down meanwhile).
            let _ = done.send(result);
        });
    }

    /// Delete superseded snapshot directories and stale staging dirs.
    fn prune(&self, snapshot_dir: &Path, keep: &str) {
        let entries = match std::fs::read_dir(snapshot_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "could not scan snapshot dir for pruning");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let superseded = name.starts_with("snapshot-") && name != keep;
            let stale_staging = name.starts_with(".tmp-");
            if (superseded || stale_staging) && entry.path().is_dir() {
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    warn!(error = %e, snapshot = %name, "failed to prune snapshot");
                }
            }
        }
    }

    /// Load the most recent snapshot at startup and reopen the store
    /// against it.  Returns the applied index to resume from.
    ///
    /// No snapshot before the first publish is normal: the store begins
    /// empty at index 0 and the whole log replays on top of it.  A missing
    /// or corrupt snapshot after one has been published (init marker
    /// present) is fatal, since replaying the compacted log from zero
    /// would silently lose data.
    pub fn load(&self) -> Result<u64, ReplicationError> {
        let snapshot_dir = self.snapshot_dir();
        let meta_dir = self.meta_dir();
        std::fs::create_dir_all(&snapshot_dir)?;
        std::fs::create_dir_all(&meta_dir)?;

        let current_path = snapshot_dir.join(CURRENT_NAME);
        let marker = meta_dir.join(INIT_MARKER_NAME);

        if !current_path.exists() {
            if marker.exists() {
                error!("a snapshot was published before but none is present");
                return Err(ReplicationError::Snapshot(
                    "snapshot missing on a node that has published one".into(),
                ));
            }
            info!("no snapshot yet: store begins empty at index 0");
            return Ok(0);
        }

        let name = std::fs::read_to_string(&current_path)?;
        let dir = snapshot_dir.join(name.trim());
        let manifest_bytes = std::fs::read(dir.join(MANIFEST_NAME)).map_err(|e| {
            ReplicationError::Snapshot(format!(
                "cannot read manifest in {}: {e}",
                dir.display()
            ))
        })?;
        let manifest: SnapshotManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| ReplicationError::Snapshot(format!("corrupt manifest: {e}")))?;

        // An existing external override wins over the local checkpoint.
        let data_dir = match &manifest.ext_snapshot_path {
            Some(ext) if ext.exists() => {
                info!(path = %ext.display(), "loading external snapshot override");
                ext.clone()
            }
            Some(ext) => {
                warn!(
                    path = %ext.display(),
                    "manifest references a missing external snapshot; using local checkpoint"
                );
                dir.join(DB_SNAPSHOT_NAME)
            }
            None => dir.join(DB_SNAPSHOT_NAME),
        };

        self.store
            .reopen(&data_dir)
            .map_err(|e| ReplicationError::Snapshot(format!("store reopen failed: {e}")))?;
        self.applied_index
            .store(manifest.applied_index, Ordering::Release);

        if !marker.exists() {
            std::fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
        }

        info!(
            applied_index = manifest.applied_index,
            snapshot = %dir.display(),
            "snapshot loaded"
        );
        Ok(manifest.applied_index)
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}

// -- Tests --------------------------------------------------------------------
