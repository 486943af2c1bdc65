//! SQLite-backed storage engine.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required.  All trait methods are synchronous rusqlite calls executed
//! under a `Mutex`.  Checkpoints use `VACUUM INTO`, which produces a
//! consistent single-file copy of the database without blocking readers.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};

use super::engine::{ApplyResult, StoreEngine, StoreOperation};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Database file name inside a checkpoint directory.
const CHECKPOINT_FILE: &str = "store.db";

/// SQLite-backed [`StoreEngine`].
pub struct SqliteStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
    /// Path of the live database file; `reopen` swaps it for a checkpoint.
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        apply_pragmas(&conn)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }
}

/// Apply recommended SQLite pragmas for performance and safety.
fn apply_pragmas(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    Ok(())
}

/// Create the required tables if they do not already exist.  Idempotent --
/// safe to call on every startup.
fn init_db(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );

        -- Replicated key/value data
        CREATE TABLE IF NOT EXISTS kv (
            key    TEXT PRIMARY KEY,
            value  TEXT NOT NULL
        );

        -- Single-row engine metadata
        CREATE TABLE IF NOT EXISTS meta (
            id           INTEGER PRIMARY KEY CHECK (id = 1),
            applied_seq  INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO meta (id, applied_seq) VALUES (1, 0);
        ",
    )?;

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, now],
    )?;

    Ok(())
}

impl StoreEngine for SqliteStore {
    fn apply(&self, op: &StoreOperation) -> anyhow::Result<ApplyResult> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;

        let result = match op {
            StoreOperation::Set { key, value } => {
                tx.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
                ApplyResult {
                    value: Some(value.clone()),
                }
            }
            StoreOperation::Delete { key } => {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                ApplyResult::default()
            }
            StoreOperation::NoOp => ApplyResult::default(),
        };

        tx.execute("UPDATE meta SET applied_seq = applied_seq + 1 WHERE id = 1", [])?;
        tx.commit()?;
        Ok(result)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn checkpoint(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        let target = dir.join(CHECKPOINT_FILE);
        // VACUUM INTO refuses to overwrite an existing file.
        if target.exists() {
            std::fs::remove_file(&target)?;
        }
        let target_str = target
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("checkpoint path is not valid UTF-8"))?;
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute("VACUUM INTO ?1", params![target_str])?;
        Ok(())
    }

    fn reopen(&self, dir: &Path) -> anyhow::Result<()> {
        let source = dir.join(CHECKPOINT_FILE);
        if !source.exists() {
            anyhow::bail!("checkpoint file not found at {}", source.display());
        }

        let mut conn = self.conn.lock().expect("mutex poisoned");

        // Point the connection at a throwaway database so the live file can
        // be replaced underneath it.
        *conn = Connection::open_in_memory()?;
        for suffix in ["", "-wal", "-shm"] {
            let mut stale = self.path.as_os_str().to_os_string();
            stale.push(suffix);
            let stale = PathBuf::from(stale);
            if stale.exists() {
                std::fs::remove_file(&stale)?;
            }
        }
        std::fs::copy(&source, &self.path)?;

        let reopened = Connection::open(&self.path)?;
        apply_pragmas(&reopened)?;
        *conn = reopened;
        Ok(())
    }

    fn current_sequence(&self) -> u64 {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row("SELECT applied_seq FROM meta WHERE id = 1", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|v| v as u64)
        .unwrap_or(0)
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(dir: &Path) -> SqliteStore {
        SqliteStore::new(dir.join("store.db")).unwrap()
    }

    fn set(key: &str, value: &str) -> StoreOperation {
        StoreOperation::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_apply_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let result = store.apply(&set("x", "1")).unwrap();
        assert_eq!(result.value.as_deref(), Some("1"));
        assert_eq!(store.get("x").unwrap().as_deref(), Some("1"));
        assert_eq!(store.current_sequence(), 1);

        store.apply(&set("x", "2")).unwrap();
        assert_eq!(store.get("x").unwrap().as_deref(), Some("2"));
        assert_eq!(store.current_sequence(), 2);
    }

    #[test]
    fn test_delete_and_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.apply(&set("x", "1")).unwrap();
        store
            .apply(&StoreOperation::Delete { key: "x".into() })
            .unwrap();
        store.apply(&StoreOperation::NoOp).unwrap();
        assert_eq!(store.get("x").unwrap(), None);
        assert_eq!(store.current_sequence(), 3);
    }

    #[test]
    fn test_checkpoint_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint_dir = dir.path().join("checkpoint");
        let store = test_store(dir.path());

        store.apply(&set("a", "1")).unwrap();
        store.checkpoint(&checkpoint_dir).unwrap();
        store.apply(&set("b", "2")).unwrap();

        store.reopen(&checkpoint_dir).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").unwrap(), None);
        assert_eq!(store.current_sequence(), 1);
    }

    #[test]
    fn test_reopen_missing_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        assert!(store.reopen(&dir.path().join("nope")).is_err());
    }
}
