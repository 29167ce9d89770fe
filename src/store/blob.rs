//! SQLite-backed blob store with shared, growable capacity
//!
//! The store's maximum size is enforced with `PRAGMA max_page_count` and the
//! same value is used for `PRAGMA mmap_size`. When a write fails with
//! `SQLITE_FULL`, the writer grows the shared capacity by one chunk,
//! re-applies it to its own connection and retries once.

use crate::error::{StoreError, StoreResult};
use crate::index::DocumentId;
use crate::store::CapacityCell;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// File name of the blob store inside an index directory
pub const BLOB_STORE_FILE: &str = "thumbs.db";

/// Initial capacity of a fresh store (5 MiB)
pub const DEFAULT_INITIAL_CAPACITY: u64 = 5 * 1024 * 1024;

/// Capacity added each time the store fills up (50 MiB)
pub const DEFAULT_GROWTH_CHUNK: u64 = 50 * 1024 * 1024;

const CREATE_BLOB_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS blob (
    id BLOB NOT NULL,
    num INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (id, num)
) WITHOUT ROWID
"#;

const STORE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

/// Where and how big a blob store is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStoreConfig {
    pub path: PathBuf,
    pub initial_capacity: u64,
    pub growth_chunk: u64,
}

impl BlobStoreConfig {
    /// Store at `path` with default sizing
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            growth_chunk: DEFAULT_GROWTH_CHUNK,
        }
    }
}

/// Per-process handle to a blob store
pub struct BlobStore {
    conn: Connection,
    path: PathBuf,
    /// `None` for read-only handles
    capacity: Option<Arc<dyn CapacityCell>>,
    applied: Cell<u64>,
    growth_chunk: u64,
    page_size: u64,
}

impl BlobStore {
    /// Open (or create) a writable store sharing `capacity`
    pub fn open(config: &BlobStoreConfig, capacity: Arc<dyn CapacityCell>) -> StoreResult<Self> {
        let conn = Connection::open(&config.path).map_err(|e| StoreError::OpenFailed {
            path: config.path.clone(),
            reason: e.to_string(),
        })?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(STORE_PRAGMAS)?;
        conn.execute(CREATE_BLOB_TABLE, [])?;

        let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
        let store = Self {
            conn,
            path: config.path.clone(),
            capacity: Some(capacity),
            applied: Cell::new(0),
            growth_chunk: config.growth_chunk.max(page_size as u64),
            page_size: page_size as u64,
        };
        store.sync_capacity()?;
        debug!(path = %store.path.display(), capacity = store.applied.get(), "Blob store opened");
        Ok(store)
    }

    /// Open an existing store for lookups only
    pub fn open_readonly(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::OpenFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        conn.busy_timeout(Duration::from_secs(30))?;
        let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            capacity: None,
            applied: Cell::new(0),
            growth_chunk: 0,
            page_size: page_size as u64,
        })
    }

    /// Store `bytes` under `(id, num)`.
    ///
    /// Returns `false` if the key already exists; the stored value is left
    /// untouched.
    pub fn write(&self, id: &DocumentId, num: u32, bytes: &[u8]) -> StoreResult<bool> {
        let cell = self.capacity.as_ref().ok_or(StoreError::ReadOnly)?;
        self.sync_capacity()?;

        match self.insert(id, num, bytes) {
            Err(e) if is_full(&e) => {
                let observed = self.applied.get();
                let grown = cell.grow(observed, self.growth_chunk);
                info!(
                    path = %self.path.display(),
                    from = observed,
                    to = grown,
                    "Blob store full, growing"
                );
                self.apply_capacity(grown)?;

                match self.insert(id, num, bytes) {
                    Err(e) if is_full(&e) => Err(StoreError::Full {
                        key: format!("{}/{}", id, num),
                        capacity: grown,
                    }),
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }

    fn insert(&self, id: &DocumentId, num: u32, bytes: &[u8]) -> rusqlite::Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR IGNORE INTO blob (id, num, data) VALUES (?1, ?2, ?3)")?;
        Ok(stmt.execute(params![&id.as_bytes()[..], num, bytes])? == 1)
    }

    /// Look up one blob
    pub fn read(&self, id: &DocumentId, num: u32) -> StoreResult<Option<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT data FROM blob WHERE id = ?1 AND num = ?2")?;
        Ok(stmt
            .query_row(params![&id.as_bytes()[..], num], |row| row.get(0))
            .optional()?)
    }

    /// All blobs of a document, ordered by sub-index
    pub fn read_all(&self, id: &DocumentId) -> StoreResult<Vec<(u32, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT num, data FROM blob WHERE id = ?1 ORDER BY num")?;
        let rows = stmt
            .query_map(params![&id.as_bytes()[..]], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of stored blobs
    pub fn len(&self) -> StoreResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM blob", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Capacity currently applied to this handle
    pub fn capacity(&self) -> u64 {
        self.applied.get()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pick up capacity grown by another process
    fn sync_capacity(&self) -> StoreResult<()> {
        if let Some(cell) = &self.capacity {
            let shared = cell.capacity();
            if shared != self.applied.get() {
                self.apply_capacity(shared)?;
            }
        }
        Ok(())
    }

    fn apply_capacity(&self, bytes: u64) -> StoreResult<()> {
        let pages = (bytes / self.page_size).max(1) as i64;
        let applied: i64 = self
            .conn
            .pragma_update_and_check(None, "max_page_count", pages, |row| row.get(0))?;
        self.conn.pragma_update(None, "mmap_size", bytes as i64)?;
        self.applied.set(bytes);
        debug!(pages, applied, "Blob store capacity applied");
        Ok(())
    }
}

fn is_full(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::DiskFull)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalCapacity;
    use tempfile::tempdir;

    const KIB: u64 = 1024;

    fn config(dir: &Path, initial: u64, chunk: u64) -> BlobStoreConfig {
        BlobStoreConfig {
            path: dir.join("thumbs.db"),
            initial_capacity: initial,
            growth_chunk: chunk,
        }
    }

    #[test]
    fn test_write_read() {
        let dir = tempdir().unwrap();
        let cfg = BlobStoreConfig::new(dir.path().join("thumbs.db"));
        let store = BlobStore::open(&cfg, Arc::new(LocalCapacity::new(cfg.initial_capacity))).unwrap();

        let id = DocumentId::random();
        assert!(store.write(&id, 0, b"first").unwrap());
        assert!(store.write(&id, 1, b"second").unwrap());

        assert_eq!(store.read(&id, 0).unwrap().as_deref(), Some(&b"first"[..]));
        assert_eq!(store.read(&id, 2).unwrap(), None);
        assert_eq!(
            store.read_all(&id).unwrap(),
            vec![(0, b"first".to_vec()), (1, b"second".to_vec())]
        );
    }

    #[test]
    fn test_write_once_per_key() {
        let dir = tempdir().unwrap();
        let cfg = BlobStoreConfig::new(dir.path().join("thumbs.db"));
        let store = BlobStore::open(&cfg, Arc::new(LocalCapacity::new(cfg.initial_capacity))).unwrap();

        let id = DocumentId::random();
        assert!(store.write(&id, 0, b"original").unwrap());
        assert!(!store.write(&id, 0, b"replacement").unwrap());
        assert_eq!(store.read(&id, 0).unwrap().unwrap(), b"original");
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_growth_past_initial_capacity() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 64 * KIB, 256 * KIB);
        let capacity = Arc::new(LocalCapacity::new(cfg.initial_capacity));
        let store = BlobStore::open(&cfg, capacity.clone()).unwrap();

        let blob = vec![0xabu8; 16 * KIB as usize];
        let ids: Vec<_> = (0..40).map(|_| DocumentId::random()).collect();
        for id in &ids {
            assert!(store.write(id, 0, &blob).unwrap());
        }

        assert!(capacity.capacity() > 64 * KIB);
        assert_eq!((capacity.capacity() - 64 * KIB) % (256 * KIB), 0);
        for id in &ids {
            assert_eq!(store.read(id, 0).unwrap().unwrap().len(), blob.len());
        }
    }

    #[test]
    fn test_other_handles_pick_up_growth() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 64 * KIB, 128 * KIB);
        let capacity = Arc::new(LocalCapacity::new(cfg.initial_capacity));
        let a = BlobStore::open(&cfg, capacity.clone()).unwrap();
        let b = BlobStore::open(&cfg, capacity.clone()).unwrap();

        let blob = vec![1u8; 8 * KIB as usize];
        for _ in 0..12 {
            a.write(&DocumentId::random(), 0, &blob).unwrap();
        }
        assert!(a.capacity() > 64 * KIB);
        assert_eq!(b.capacity(), 64 * KIB);

        b.write(&DocumentId::random(), 0, b"small").unwrap();
        assert_eq!(b.capacity(), capacity.capacity());
    }

    #[test]
    fn test_second_failure_is_hard_error() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 64 * KIB, 4 * KIB);
        let store = BlobStore::open(&cfg, Arc::new(LocalCapacity::new(cfg.initial_capacity))).unwrap();

        let huge = vec![7u8; 512 * KIB as usize];
        let err = store.write(&DocumentId::random(), 0, &huge).unwrap_err();
        assert!(matches!(err, StoreError::Full { .. }));
    }

    #[test]
    fn test_readonly_rejects_writes() {
        let dir = tempdir().unwrap();
        let cfg = BlobStoreConfig::new(dir.path().join("thumbs.db"));
        let id = DocumentId::random();
        {
            let store = BlobStore::open(&cfg, Arc::new(LocalCapacity::new(cfg.initial_capacity))).unwrap();
            store.write(&id, 0, b"kept").unwrap();
        }

        let ro = BlobStore::open_readonly(&cfg.path).unwrap();
        assert_eq!(ro.read(&id, 0).unwrap().unwrap(), b"kept");
        assert!(matches!(ro.write(&id, 1, b"x"), Err(StoreError::ReadOnly)));
    }
}
