//! Worker pool: owns the queue, the coordination region and the supervisors
//!
//! The pool is responsible for:
//! - Creating the durable queue and the shared region
//! - Starting one supervisor thread per worker slot
//! - Accepting jobs from the producer
//! - Draining: waiting until nothing is queued and nobody is busy
//! - Stopping workers and removing the queue files

use crate::error::{QueueError, Result, ScanError, WorkerError};
use crate::ipc::{CoordinationRegion, DrainStatus, RegionSnapshot, MAX_WORKERS};
use crate::pool::supervisor::{CrashReport, Supervisor, SupervisorEvent};
use crate::pool::worker::{JobHandler, WorkerSetup};
use crate::queue::{queue_file_name, remove_files, Job, JobKind, JobQueue, PushOutcome, FULL_BACKOFF};
use crate::store::{BlobStore, BlobStoreConfig, CapacityCell};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default cap on the queue file (256 MiB)
pub const DEFAULT_MAX_QUEUE_BYTES: u64 = 256 * 1024 * 1024;

/// Poll interval of the drain wait
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Directory for the queue file and region: tmpfs when available
pub fn default_queue_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        env::temp_dir()
    }
}

/// Pool construction parameters
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes
    pub workers: usize,

    /// Job kind the pool's queue carries
    pub kind: JobKind,

    /// Where the queue file and coordination region live
    pub queue_dir: PathBuf,

    /// Size cap of the queue file
    pub max_queue_bytes: u64,

    /// Output directory for worker shards
    pub shard_dir: Option<PathBuf>,

    /// Blob store shared by the workers
    pub blob_store: Option<BlobStoreConfig>,
}

impl PoolConfig {
    pub fn new(workers: usize, kind: JobKind) -> Self {
        Self {
            workers,
            kind,
            queue_dir: default_queue_dir(),
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
            shard_dir: None,
            blob_store: None,
        }
    }

    pub fn with_queue_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.queue_dir = dir.into();
        self
    }

    pub fn with_max_queue_bytes(mut self, bytes: u64) -> Self {
        self.max_queue_bytes = bytes;
        self
    }

    pub fn with_shard_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shard_dir = Some(dir.into());
        self
    }

    pub fn with_blob_store(mut self, config: BlobStoreConfig) -> Self {
        self.blob_store = Some(config);
        self
    }
}

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl PoolState {
    pub fn name(self) -> &'static str {
        match self {
            PoolState::Created => "created",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Stopped => "stopped",
        }
    }
}

/// Result of a drained pool
#[derive(Debug, Clone)]
pub struct PoolReport {
    /// Jobs whose handler returned (successfully or not)
    pub completed: u64,

    /// Worker processes started, including replacements
    pub spawned: u64,

    /// Workers that died on a signal
    pub crashes: Vec<CrashReport>,

    /// Final counters
    pub snapshot: RegionSnapshot,

    /// Time from start to drain
    pub duration: Duration,
}

/// Progress information for display
#[derive(Debug, Clone)]
pub struct PoolProgress {
    pub queued: u64,
    pub busy: u64,
    pub completed: u64,
    pub crashed: u64,
    pub workers: usize,
    pub elapsed: Duration,
}

impl PoolProgress {
    /// Completed jobs per second
    pub fn jobs_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.completed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Read-only view of a running pool, usable from other threads
#[derive(Clone)]
pub struct PoolMonitor {
    region: CoordinationRegion,
    started: Instant,
}

impl PoolMonitor {
    pub fn progress(&self) -> PoolProgress {
        let snap = self.region.snapshot();
        PoolProgress {
            queued: snap.queued,
            busy: snap.busy,
            completed: snap.completed,
            crashed: snap.crashed,
            workers: self.region.worker_count(),
            elapsed: self.started.elapsed(),
        }
    }

    /// Current blob store capacity shared by the workers
    pub fn blob_capacity(&self) -> u64 {
        self.region.capacity()
    }
}

/// Multi-process worker pool
pub struct WorkerPool {
    config: PoolConfig,
    region: CoordinationRegion,
    /// `None` only after the pool has been torn down
    queue: Option<JobQueue>,
    setup: Arc<WorkerSetup>,
    fork_guard: Arc<RwLock<()>>,
    supervisors: Vec<Supervisor>,
    events_tx: Sender<SupervisorEvent>,
    events_rx: Receiver<SupervisorEvent>,
    interrupt: Arc<AtomicBool>,
    state: PoolState,
    started: Instant,
}

impl WorkerPool {
    /// Create the queue and region. No process is started yet.
    pub fn create(config: PoolConfig, handler: Arc<dyn JobHandler>) -> Result<Self> {
        if config.workers == 0 || config.workers > MAX_WORKERS {
            return Err(crate::error::ConfigError::InvalidWorkerCount {
                count: config.workers,
                max: MAX_WORKERS,
            }
            .into());
        }

        let initial_capacity = config
            .blob_store
            .as_ref()
            .map_or(0, |store| store.initial_capacity);
        let region = CoordinationRegion::create(&config.queue_dir, config.workers, initial_capacity)?;

        let queue_path = queue_file_name(&config.queue_dir);
        let queue = JobQueue::create(
            &queue_path,
            region.clone(),
            config.kind,
            config.max_queue_bytes,
        )?;

        // Create the store schema once, before any worker opens it
        if let Some(store) = &config.blob_store {
            BlobStore::open(store, Arc::new(region.clone()))?;
        }

        let setup = Arc::new(WorkerSetup {
            region: region.clone(),
            queue_path,
            kind: config.kind,
            max_queue_bytes: config.max_queue_bytes,
            shard_dir: config.shard_dir.clone(),
            blob_store: config.blob_store.clone(),
            handler,
        });

        let (events_tx, events_rx) = unbounded();

        debug!(
            workers = config.workers,
            queue = %queue.path().display(),
            region = %region.path().display(),
            "Worker pool created"
        );

        Ok(Self {
            config,
            region,
            queue: Some(queue),
            setup,
            fork_guard: Arc::new(RwLock::new(())),
            supervisors: Vec::new(),
            events_tx,
            events_rx,
            interrupt: Arc::new(AtomicBool::new(false)),
            state: PoolState::Created,
            started: Instant::now(),
        })
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Flag that makes [`push`](Self::push) and [`wait`](Self::wait) give up
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Share an existing interrupt flag, e.g. one set by a signal handler
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn monitor(&self) -> PoolMonitor {
        PoolMonitor {
            region: self.region.clone(),
            started: self.started,
        }
    }

    fn queue(&self) -> Result<&JobQueue> {
        self.queue.as_ref().ok_or_else(|| {
            WorkerError::InvalidState {
                operation: "use",
                state: PoolState::Stopped.name(),
            }
            .into()
        })
    }

    fn expect_state(&self, allowed: &[PoolState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(WorkerError::InvalidState {
                operation,
                state: self.state.name(),
            }
            .into())
        }
    }

    /// CREATED → RUNNING: start one supervisor per slot
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(&[PoolState::Created], "start")?;

        self.started = Instant::now();
        for slot in 0..self.config.workers {
            let supervisor = Supervisor::spawn(
                slot,
                Arc::clone(&self.setup),
                Arc::clone(&self.fork_guard),
                self.events_tx.clone(),
            )?;
            self.supervisors.push(supervisor);
        }
        self.state = PoolState::Running;

        info!(workers = self.supervisors.len(), "Worker pool started");
        Ok(())
    }

    /// Enqueue a job, backing off while the queue is full
    pub fn push(&self, job: impl Into<Job>) -> Result<()> {
        self.expect_state(&[PoolState::Created, PoolState::Running], "push to")?;
        let queue = self.queue()?;
        let job = job.into();

        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                return Err(ScanError::Interrupted);
            }

            let outcome = {
                let _guard = self.fork_guard.read();
                queue.try_push(&job)?
            };
            match outcome {
                PushOutcome::Queued => return Ok(()),
                PushOutcome::Full => {
                    if self.region.snapshot().fatal {
                        return Err(QueueError::Stopped.into());
                    }
                    thread::sleep(FULL_BACKOFF);
                }
            }
        }
    }

    /// Drain the pool and stop every worker.
    ///
    /// RUNNING → DRAINING → STOPPED. Returns once nothing is queued and no
    /// worker is busy, or earlier on a fatal worker error, an interrupt, or
    /// if every supervisor has ended.
    pub fn wait(mut self) -> Result<PoolReport> {
        self.expect_state(&[PoolState::Running], "wait on")?;
        self.state = PoolState::Draining;
        self.region.begin_drain();
        debug!("Pool draining");

        let outcome = self.drain()?;

        self.region.request_stop();
        self.state = PoolState::Stopped;
        let join_errors = self.join_supervisors();

        let mut report = PoolReport {
            completed: 0,
            spawned: 0,
            crashes: Vec::new(),
            snapshot: self.region.snapshot(),
            duration: self.started.elapsed(),
        };
        report.completed = report.snapshot.completed;
        for event in self.events_rx.try_iter() {
            match event {
                SupervisorEvent::Spawned { .. } => report.spawned += 1,
                SupervisorEvent::Crashed(crash) => report.crashes.push(crash),
                SupervisorEvent::Exited { .. } => {}
            }
        }

        match outcome {
            DrainOutcome::Drained => {
                info!(
                    completed = report.completed,
                    crashes = report.crashes.len(),
                    duration_ms = report.duration.as_millis() as u64,
                    "Worker pool drained"
                );
                Ok(report)
            }
            DrainOutcome::Interrupted => Err(ScanError::Interrupted),
            DrainOutcome::Fatal | DrainOutcome::Abandoned => {
                let mut errors = join_errors;
                let first_fatal = errors
                    .iter()
                    .position(|e| matches!(e, WorkerError::Fatal { .. }))
                    .unwrap_or(0);
                let err = if errors.is_empty() {
                    WorkerError::AllWorkersDead
                } else {
                    errors.swap_remove(first_fatal)
                };
                Err(err.into())
            }
        }
    }

    fn drain(&self) -> Result<DrainOutcome> {
        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                info!("Interrupted while draining");
                return Ok(DrainOutcome::Interrupted);
            }
            match self.region.wait_drained(DRAIN_POLL) {
                DrainStatus::Fatal => return Ok(DrainOutcome::Fatal),
                DrainStatus::Drained => {
                    // Counters can drift if a worker died mid-statement
                    let rows = {
                        let _guard = self.fork_guard.read();
                        self.queue()?.reconcile()?
                    };
                    if rows == 0 {
                        return Ok(DrainOutcome::Drained);
                    }
                    warn!(rows, "Queue counter was behind the table");
                }
                DrainStatus::Pending => {
                    if self.supervisors.iter().all(Supervisor::is_finished) {
                        warn!("All supervisors ended with work outstanding");
                        return Ok(DrainOutcome::Abandoned);
                    }
                }
            }
        }
    }

    fn join_supervisors(&mut self) -> Vec<WorkerError> {
        let mut errors = Vec::new();
        for supervisor in self.supervisors.drain(..) {
            let slot = supervisor.slot();
            if let Err(e) = supervisor.join() {
                warn!(slot, error = %e, "Supervisor ended with an error");
                errors.push(e);
            }
        }
        errors
    }
}

enum DrainOutcome {
    Drained,
    Fatal,
    Interrupted,
    Abandoned,
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.supervisors.is_empty() {
            self.region.request_stop();
            self.join_supervisors();
        }
        if let Some(queue) = self.queue.take() {
            let path = queue.path().to_path_buf();
            drop(queue);
            if let Err(e) = remove_files(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove queue files");
            }
        }
    }
}
