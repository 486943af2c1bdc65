//! In-memory storage engine.
//!
//! Keeps all data in a `RwLock<HashMap>`.  Checkpoints are a serde_json
//! dump of the map plus the sequence counter, so checkpoint/reopen works
//! the same way it does for the durable engines.  Useful for testing and
//! single-node experiments.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::engine::{ApplyResult, StoreEngine, StoreOperation};

/// File written inside a checkpoint directory.
const STATE_FILE: &str = "state.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    data: HashMap<String, String>,
    sequence: u64,
}

/// Memory-backed [`StoreEngine`].
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreEngine for MemoryStore {
    fn apply(&self, op: &StoreOperation) -> anyhow::Result<ApplyResult> {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        inner.sequence += 1;
        let result = match op {
            StoreOperation::Set { key, value } => {
                inner.data.insert(key.clone(), value.clone());
                ApplyResult {
                    value: Some(value.clone()),
                }
            }
            StoreOperation::Delete { key } => {
                inner.data.remove(key);
                ApplyResult::default()
            }
            StoreOperation::NoOp => ApplyResult::default(),
        };
        Ok(result)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let inner = self.inner.read().expect("rwlock poisoned");
        Ok(inner.data.get(key).cloned())
    }

    fn checkpoint(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        let serialized = {
            let inner = self.inner.read().expect("rwlock poisoned");
            serde_json::to_vec_pretty(&*inner)?
        };
        std::fs::write(dir.join(STATE_FILE), serialized)?;
        Ok(())
    }

    fn reopen(&self, dir: &Path) -> anyhow::Result<()> {
        let contents = std::fs::read(dir.join(STATE_FILE))?;
        let loaded: Inner = serde_json::from_slice(&contents)?;
        let mut inner = self.inner.write().expect("rwlock poisoned");
        *inner = loaded;
        Ok(())
    }

    fn current_sequence(&self) -> u64 {
        self.inner.read().expect("rwlock poisoned").sequence
    }
}

// -- Tests --------------------------------------------------------------------
