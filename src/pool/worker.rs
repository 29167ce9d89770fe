//! Worker process body
//!
//! Each worker process:
//! - Opens its own connection to the job queue (connections never cross fork)
//! - Claims jobs and hands them to the pool's [`JobHandler`]
//! - Runs derived jobs inline when the queue is at its size cap
//! - Lazily opens its private shard and a blob store handle on first use
//! - Dies with its parent (`PR_SET_PDEATHSIG`)
//! - Exits via `_exit` so no parent-owned destructor runs in the child

use crate::error::{Result, ShardError, StoreError};
use crate::index::{Document, DocumentId, ShardWriter};
use crate::ipc::CoordinationRegion;
use crate::queue::{Job, JobKind, JobQueue, PushOutcome};
use crate::store::{BlobStore, BlobStoreConfig};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{getppid, Pid};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Exit status of a worker that stopped on an unrecoverable error
pub const EXIT_FATAL: i32 = 70;

/// Processes one job inside a worker process.
///
/// Errors for which [`ScanError::is_fatal`](crate::error::ScanError::is_fatal)
/// is false are logged and the worker moves on to the next job. Fatal errors
/// end the worker and the run.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: Job, ctx: &mut WorkerContext) -> Result<()>;
}

/// Everything a supervisor needs to start worker processes
pub(crate) struct WorkerSetup {
    pub region: CoordinationRegion,
    pub queue_path: PathBuf,
    pub kind: JobKind,
    pub max_queue_bytes: u64,
    pub shard_dir: Option<PathBuf>,
    pub blob_store: Option<BlobStoreConfig>,
    pub handler: Arc<dyn JobHandler>,
}

/// Per-process state handed to [`JobHandler::handle`]
pub struct WorkerContext {
    slot: usize,
    queue: JobQueue,
    shard_dir: Option<PathBuf>,
    shard: Option<ShardWriter>,
    blob_config: Option<BlobStoreConfig>,
    blobs: Option<BlobStore>,
    overflow: VecDeque<Job>,
    processed: u64,
}

impl WorkerContext {
    pub(crate) fn new(
        slot: usize,
        queue: JobQueue,
        shard_dir: Option<PathBuf>,
        blob_config: Option<BlobStoreConfig>,
    ) -> Self {
        Self {
            slot,
            queue,
            shard_dir,
            shard: None,
            blob_config,
            blobs: None,
            overflow: VecDeque::new(),
            processed: 0,
        }
    }

    /// Worker slot this process occupies
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Jobs handled successfully so far by this process
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Enqueue a derived job.
    ///
    /// A worker never waits on a full queue: every worker could be doing
    /// the same and none would be left to drain it. When the queue is at
    /// its cap the job is kept here and run by this process after the
    /// current one.
    pub fn push(&mut self, job: impl Into<Job>) -> Result<()> {
        let job = job.into();
        match self.queue.try_push(&job)? {
            PushOutcome::Queued => {}
            PushOutcome::Full => {
                debug!(slot = self.slot, path = %job.describe(), "Queue full, running job inline");
                self.overflow.push_back(job);
            }
        }
        Ok(())
    }

    /// Derived jobs waiting to run inline
    pub fn pending_inline(&self) -> usize {
        self.overflow.len()
    }

    /// Append a record to this process's shard
    pub fn write_document(&mut self, doc: &Document) -> Result<()> {
        let shard = match self.shard.take() {
            Some(shard) => shard,
            None => {
                let dir = self.shard_dir.as_deref().ok_or_else(|| {
                    ShardError::Io(io::Error::other("no shard directory configured"))
                })?;
                ShardWriter::open(dir)?
            }
        };
        self.shard.insert(shard).append(doc)?;
        Ok(())
    }

    /// Blob store handle, opened on first use
    pub fn blobs(&mut self) -> Result<&BlobStore> {
        let store = match self.blobs.take() {
            Some(store) => store,
            None => {
                let config = self.blob_config.as_ref().ok_or_else(|| StoreError::OpenFailed {
                    path: PathBuf::new(),
                    reason: "no blob store configured".into(),
                })?;
                BlobStore::open(config, Arc::new(self.queue.region().clone()))?
            }
        };
        Ok(self.blobs.insert(store))
    }

    /// Store a blob for `id`. Returns `false` if the key already existed.
    pub fn write_blob(&mut self, id: &DocumentId, num: u32, bytes: &[u8]) -> Result<bool> {
        Ok(self.blobs()?.write(id, num, bytes)?)
    }

    /// Shard path, once the first record has been written
    pub fn shard_path(&self) -> Option<&Path> {
        self.shard.as_ref().map(|s| s.path())
    }

    /// Close the shard and blob store
    pub(crate) fn finish(self) -> Result<()> {
        if let Some(shard) = self.shard {
            shard.finish()?;
        }
        drop(self.blobs);
        Ok(())
    }
}

/// Entry point of a freshly forked child. Never returns.
pub(crate) fn run_child(slot: usize, parent: Pid, setup: &WorkerSetup) -> ! {
    // Ctrl-C is handled by the parent, which stops the pool
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::SigIgn);
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
    }
    // The parent may have died before the request took effect
    if getppid() != parent {
        unsafe { libc::_exit(EXIT_FATAL) }
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker_main(slot, setup)));
    let code = match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!(slot, pid = process::id(), error = %e, "Worker stopping on fatal error");
            EXIT_FATAL
        }
        // Report a panic to the supervisor the same way as a fault
        Err(_) => process::abort(),
    };
    unsafe { libc::_exit(code) }
}

/// Run `job` and every job it derives that did not fit in the queue.
/// Returns the first fatal error; other failures are logged.
fn run_job(slot: usize, setup: &WorkerSetup, ctx: &mut WorkerContext, job: Job) -> Result<()> {
    let mut next = Some(job);
    while let Some(job) = next {
        let path = job.describe();
        setup.region.set_current_job(slot, &path);
        match setup.handler.handle(job, ctx) {
            Ok(()) => ctx.processed += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(slot, path = %path, error = %e, "Job failed"),
        }
        next = ctx.overflow.pop_front();
        if next.is_some() {
            setup.region.inline_job_finished();
        }
    }
    Ok(())
}

/// Claim-and-handle loop of one worker process
fn worker_main(slot: usize, setup: &WorkerSetup) -> Result<()> {
    let queue = JobQueue::open(
        &setup.queue_path,
        setup.region.clone(),
        setup.kind,
        setup.max_queue_bytes,
    )?;
    let mut ctx = WorkerContext::new(
        slot,
        queue,
        setup.shard_dir.clone(),
        setup.blob_store.clone(),
    );
    setup.region.mark_initialized();
    debug!(slot, pid = process::id(), "Worker ready");

    while let Some(job) = ctx.queue.claim(slot)? {
        // The slot stays busy through inline jobs so a drain waits for them
        let result = run_job(slot, setup, &mut ctx, job);
        // Raise the flag before going idle so a drain cannot finish first
        if result.is_err() {
            setup.region.mark_fatal();
        }
        setup.region.job_finished(slot);
        result?;
    }

    debug!(slot, processed = ctx.processed, "Worker leaving");
    ctx.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::shard::read_documents;
    use crate::queue::{queue_file_name, ParseJob, StatSnapshot};
    use crate::store::LocalCapacity;
    use tempfile::tempdir;

    fn context(dir: &Path, shard: bool, blobs: bool) -> (CoordinationRegion, WorkerContext) {
        let region = CoordinationRegion::create(dir, 1, 1024 * 1024).unwrap();
        let queue = JobQueue::create(
            &queue_file_name(dir),
            region.clone(),
            JobKind::Parse,
            1024 * 1024,
        )
        .unwrap();
        let shard_dir = shard.then(|| dir.to_path_buf());
        let blob_config = blobs.then(|| BlobStoreConfig::new(dir.join("thumbs.db")));
        (region, WorkerContext::new(0, queue, shard_dir, blob_config))
    }

    #[test]
    fn test_write_document_opens_shard_lazily() {
        let dir = tempdir().unwrap();
        let (_region, mut ctx) = context(dir.path(), true, false);
        assert!(ctx.shard_path().is_none());

        let doc = Document::new(DocumentId::random(), "a.txt".into(), 1, 2, 3, 0).unwrap();
        ctx.write_document(&doc).unwrap();
        ctx.write_document(&doc).unwrap();

        let path = ctx.shard_path().unwrap().to_path_buf();
        ctx.finish().unwrap();
        assert_eq!(read_documents(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_outputs_are_fatal() {
        let dir = tempdir().unwrap();
        let (_region, mut ctx) = context(dir.path(), false, false);
        let doc = Document::new(DocumentId::random(), "a.txt".into(), 1, 2, 3, 0).unwrap();

        let err = ctx.write_document(&doc).unwrap_err();
        assert!(err.is_fatal());
        let err = ctx.write_blob(&doc.id, 0, b"x").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_blob_store_shares_region_capacity() {
        let dir = tempdir().unwrap();
        let (region, mut ctx) = context(dir.path(), false, true);
        let id = DocumentId::random();
        assert!(ctx.write_blob(&id, 0, b"thumb").unwrap());
        assert!(!ctx.write_blob(&id, 0, b"other").unwrap());
        assert_eq!(ctx.blobs().unwrap().capacity(), region.snapshot().blob_capacity);

        let local = BlobStore::open(
            &BlobStoreConfig::new(dir.path().join("thumbs.db")),
            Arc::new(LocalCapacity::new(1024 * 1024)),
        )
        .unwrap();
        assert_eq!(local.read(&id, 0).unwrap().as_deref(), Some(&b"thumb"[..]));
    }

    #[test]
    fn test_push_derived_job() {
        let dir = tempdir().unwrap();
        let (region, mut ctx) = context(dir.path(), false, false);
        let job = ParseJob::new("/tmp/archive.zip/member.txt".into(), StatSnapshot::default())
            .with_parent(DocumentId::random());
        ctx.push(job).unwrap();
        assert_eq!(region.snapshot().queued, 1);
        assert_eq!(ctx.pending_inline(), 0);
    }

    #[test]
    fn test_push_to_full_queue_runs_inline() {
        let dir = tempdir().unwrap();
        let region = CoordinationRegion::create(dir.path(), 1, 1024 * 1024).unwrap();
        let queue = JobQueue::create(
            &queue_file_name(dir.path()),
            region.clone(),
            JobKind::Parse,
            64 * 1024,
        )
        .unwrap();
        let mut ctx = WorkerContext::new(0, queue, None, None);

        let long = "x".repeat(2000);
        for i in 0..100 {
            let path = PathBuf::from(format!("/tmp/{long}/{i}.txt"));
            ctx.push(ParseJob::new(path, StatSnapshot::default())).unwrap();
        }

        let queued = region.snapshot().queued;
        assert!(queued > 0);
        assert!(ctx.pending_inline() > 0);
        assert_eq!(queued as usize + ctx.pending_inline(), 100);
    }
}
