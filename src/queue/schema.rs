//! SQLite schema and connection settings for the job queue

use crate::error::QueueResult;
use rusqlite::Connection;
use std::time::Duration;

/// Job rows. `INTEGER PRIMARY KEY` gives insertion order for "oldest first".
const CREATE_JOB_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job (
    id INTEGER PRIMARY KEY,
    kind INTEGER NOT NULL,
    payload BLOB NOT NULL
)
"#;

const CREATE_JOB_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_job_kind ON job(kind, id)";

/// The queue only has to survive worker crashes, not power loss
const QUEUE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = OFF;
PRAGMA temp_store = MEMORY;
PRAGMA cache_size = -8000;
"#;

/// Statement that atomically removes and returns the oldest job of a kind
pub const POP_OLDEST: &str =
    "DELETE FROM job WHERE id = (SELECT MIN(id) FROM job WHERE kind = ?1) RETURNING payload";

pub const INSERT_JOB: &str = "INSERT INTO job (kind, payload) VALUES (?1, ?2)";

/// Apply per-connection settings and the page cap. Returns the cap in pages.
pub fn configure(conn: &Connection, max_bytes: u64) -> QueueResult<i64> {
    conn.busy_timeout(Duration::from_secs(10))?;
    conn.execute_batch(QUEUE_PRAGMAS)?;

    let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
    let pages = (max_bytes as i64 / page_size).max(8);
    let applied = conn.pragma_update_and_check(None, "max_page_count", pages, |row| row.get(0))?;
    Ok(applied)
}

/// Create the queue tables
pub fn create_queue(conn: &Connection) -> QueueResult<()> {
    conn.execute(CREATE_JOB_TABLE, [])?;
    conn.execute(CREATE_JOB_INDEX, [])?;
    Ok(())
}
