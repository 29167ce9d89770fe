//! SQLite-backed job queue shared by the supervisor and its workers
//!
//! Every process opens its own connection to the same file. All statements
//! run under the region's queue lock and each push or removal updates the
//! region counters while that lock is held, so the counters match the rows.

use crate::error::{QueueError, QueueResult};
use crate::ipc::{Availability, CoordinationRegion};
use crate::queue::job::{Job, JobKind};
use crate::queue::schema::{configure, create_queue, INSERT_JOB, POP_OLDEST};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Pause between attempts while the queue is at its size cap
pub const FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of a single insert attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue file reached its size cap
    Full,
}

/// One process's handle on the durable queue
pub struct JobQueue {
    conn: Connection,
    region: CoordinationRegion,
    kind: JobKind,
    path: PathBuf,
}

impl JobQueue {
    /// Create the queue file and its schema
    pub fn create(
        path: &Path,
        region: CoordinationRegion,
        kind: JobKind,
        max_bytes: u64,
    ) -> QueueResult<Self> {
        let queue = Self::connect(path, region, kind, max_bytes)?;
        {
            let _q = queue.region.lock_queue();
            create_queue(&queue.conn)?;
        }
        debug!(path = %path.display(), kind = kind.name(), max_bytes, "Created job queue");
        Ok(queue)
    }

    /// Open an existing queue file. Forked workers call this; a connection
    /// must never cross a fork.
    pub fn open(
        path: &Path,
        region: CoordinationRegion,
        kind: JobKind,
        max_bytes: u64,
    ) -> QueueResult<Self> {
        Self::connect(path, region, kind, max_bytes)
    }

    fn connect(
        path: &Path,
        region: CoordinationRegion,
        kind: JobKind,
        max_bytes: u64,
    ) -> QueueResult<Self> {
        let conn = Connection::open(path).map_err(|e| QueueError::CreateFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        {
            // journal_mode changes take a write lock on the file
            let _q = region.lock_queue();
            configure(&conn, max_bytes)?;
        }
        Ok(Self {
            conn,
            region,
            kind,
            path: path.to_path_buf(),
        })
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn region(&self) -> &CoordinationRegion {
        &self.region
    }

    /// Insert once. `Full` means the size cap was hit and nothing was stored.
    pub fn try_push(&self, job: &Job) -> QueueResult<PushOutcome> {
        if job.kind() != self.kind {
            return Err(QueueError::WrongKind {
                expected: self.kind.name(),
                found: job.kind().name(),
            });
        }
        let payload = job.encode()?;

        let _q = self.region.lock_queue();
        let mut stmt = self.conn.prepare_cached(INSERT_JOB)?;
        match stmt.execute(params![self.kind.code(), payload]) {
            Ok(_) => {
                self.region.job_pushed();
                Ok(PushOutcome::Queued)
            }
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::DiskFull) => Ok(PushOutcome::Full),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert, backing off while the queue is full
    pub fn push(&self, job: &Job) -> QueueResult<()> {
        let mut warned = false;
        loop {
            if self.region.is_stopped() {
                return Err(QueueError::Stopped);
            }
            match self.try_push(job)? {
                PushOutcome::Queued => return Ok(()),
                PushOutcome::Full => {
                    if !warned {
                        warn!(path = %self.path.display(), "Job queue full, waiting for consumers");
                        warned = true;
                    }
                    thread::sleep(FULL_BACKOFF);
                }
            }
        }
    }

    /// Remove the oldest job, blocking while the queue is empty.
    ///
    /// Returns `None` once the producer has finished and nothing is left,
    /// or when the pool stops.
    pub fn pop(&self) -> QueueResult<Option<Job>> {
        loop {
            match self.region.await_jobs(true) {
                Availability::Stopped => return Ok(None),
                Availability::Drained => {
                    let _q = self.region.lock_queue();
                    let rows = self.count_rows()?;
                    if rows == 0 {
                        return Ok(None);
                    }
                    self.region.set_queued(rows);
                }
                Availability::Ready => {
                    let _q = self.region.lock_queue();
                    match self.take_oldest()? {
                        Some(bytes) => {
                            self.region.job_taken();
                            return Job::decode(&bytes).map(Some);
                        }
                        None => self.region.set_queued(self.count_rows()?),
                    }
                }
            }
        }
    }

    /// Worker variant of [`pop`](Self::pop): the removed job is recorded as
    /// running in `slot` in the same step. Returns `None` when the pool stops.
    pub fn claim(&self, slot: usize) -> QueueResult<Option<Job>> {
        loop {
            if self.region.await_jobs(false) == Availability::Stopped {
                return Ok(None);
            }
            let _q = self.region.lock_queue();
            let Some(bytes) = self.take_oldest()? else {
                // Counter ran ahead of the table
                self.region.set_queued(self.count_rows()?);
                continue;
            };
            match Job::decode(&bytes) {
                Ok(job) => {
                    self.region.job_claimed(slot, &job.describe());
                    return Ok(Some(job));
                }
                Err(e) => {
                    self.region.job_taken();
                    return Err(e);
                }
            }
        }
    }

    /// Delete and return the oldest row of this queue's kind. Caller holds
    /// the queue lock.
    fn take_oldest(&self) -> QueueResult<Option<Vec<u8>>> {
        let mut stmt = self.conn.prepare_cached(POP_OLDEST)?;
        let payload = stmt
            .query_row(params![self.kind.code()], |row| row.get(0))
            .optional()?;
        Ok(payload)
    }

    fn count_rows(&self) -> QueueResult<u64> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM job WHERE kind = ?1")?;
        let n: i64 = stmt.query_row(params![self.kind.code()], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Rows currently stored
    pub fn len(&self) -> QueueResult<u64> {
        let _q = self.region.lock_queue();
        self.count_rows()
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Reset the region's queued counter to the stored row count
    pub fn reconcile(&self) -> QueueResult<u64> {
        let _q = self.region.lock_queue();
        let rows = self.count_rows()?;
        self.region.set_queued(rows);
        Ok(rows)
    }
}

/// Fresh, collision-free queue file name in `dir`
pub fn queue_file_name(dir: &Path) -> PathBuf {
    dir.join(format!(
        "docscan-queue-{}-{}.db",
        std::process::id(),
        Uuid::new_v4().simple()
    ))
}

/// Remove a queue database and its WAL side files
pub fn remove_files(path: &Path) -> io::Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }
    for file in candidates {
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
