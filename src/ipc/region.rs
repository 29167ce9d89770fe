//! Coordination region shared by the supervisor and all worker processes
//!
//! The region is a fixed-layout, versioned `#[repr(C)]` record placed in a
//! [`SharedSegment`]. It is only reached through the accessor methods on
//! [`CoordinationRegion`], each of which takes the relevant lock.
//!
//! Lock order is `queue_lock` → `data` → `slots`.

use crate::error::WorkerError;
use crate::ipc::segment::SharedSegment;
use crate::ipc::sync::{ProcessCondvar, ProcessMutex, ProcessMutexGuard};
use crate::store::CapacityCell;
use std::mem::size_of;
use std::path::Path;
use std::ptr::addr_of_mut;
use std::sync::Arc;
use std::time::Duration;

/// Marker written at the start of every region ("DSCR")
pub const REGION_MAGIC: u32 = 0x4453_4352;

/// Layout version; bump when any field below changes
pub const REGION_VERSION: u32 = 1;

/// Maximum number of worker slots
pub const MAX_WORKERS: usize = 256;

/// Bytes of job path kept per slot for crash reports
pub const SLOT_PATH_LEN: usize = 4096;

/// Slice length for bounded waits on `has_work`
const WORK_WAIT_SLICE: Duration = Duration::from_millis(10);

#[repr(C)]
struct RegionHeader {
    magic: u32,
    version: u32,
    workers: u32,
    _reserved: u32,
}

/// Counters and flags, guarded by the data mutex. All-zero is the initial state.
#[repr(C)]
struct Counters {
    queued: i64,
    busy: i64,
    completed: u64,
    initialized: u64,
    crashed: u64,
    blob_capacity: u64,
    no_more_jobs: bool,
    stop: bool,
    fatal: bool,
}

#[repr(C)]
struct WorkerSlot {
    pid: i32,
    busy: bool,
    path_len: u32,
    path: [u8; SLOT_PATH_LEN],
}

impl WorkerSlot {
    fn set_path(&mut self, path: &str) {
        let mut end = path.len().min(SLOT_PATH_LEN);
        while !path.is_char_boundary(end) {
            end -= 1;
        }
        self.path[..end].copy_from_slice(&path.as_bytes()[..end]);
        self.path_len = end as u32;
    }

    fn path(&self) -> Option<String> {
        if self.path_len == 0 {
            return None;
        }
        let bytes = &self.path[..self.path_len as usize];
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[repr(C)]
struct RegionLayout {
    header: RegionHeader,
    data: ProcessMutex<Counters>,
    queue_lock: ProcessMutex<()>,
    has_work: ProcessCondvar,
    done_working: ProcessCondvar,
    slots: ProcessMutex<[WorkerSlot; MAX_WORKERS]>,
}

/// What a waiting consumer should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// At least one job is queued
    Ready,
    /// Producer is done and nothing is queued
    Drained,
    /// Pool is shutting down
    Stopped,
}

/// Result of one bounded wait on the drain predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// `queued == 0 && busy <= 0`
    Drained,
    /// A worker hit an unrecoverable error
    Fatal,
    /// Work still outstanding
    Pending,
}

/// Point-in-time copy of the region's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSnapshot {
    pub queued: u64,
    pub busy: u64,
    pub completed: u64,
    pub initialized: u64,
    pub crashed: u64,
    pub blob_capacity: u64,
    pub no_more_jobs: bool,
    pub stop: bool,
    pub fatal: bool,
}

struct RegionInner {
    segment: SharedSegment,
    owner: u32,
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        // Forked children leave via _exit and never get here; the check
        // covers a child that unwinds instead.
        if std::process::id() != self.owner {
            return;
        }
        let layout = unsafe { &*(self.segment.as_ptr() as *const RegionLayout) };
        unsafe {
            layout.has_work.destroy();
            layout.done_working.destroy();
            layout.data.destroy();
            layout.queue_lock.destroy();
            layout.slots.destroy();
        }
    }
}

/// Handle to the shared coordination region. Cheap to clone.
#[derive(Clone)]
pub struct CoordinationRegion {
    inner: Arc<RegionInner>,
}

impl CoordinationRegion {
    /// Create a region for `workers` slots in `dir` with the given initial
    /// blob store capacity.
    pub fn create(dir: &Path, workers: usize, blob_capacity: u64) -> Result<Self, WorkerError> {
        if workers == 0 || workers > MAX_WORKERS {
            return Err(WorkerError::RegionInit(format!(
                "worker count {} outside 1..={}",
                workers, MAX_WORKERS
            )));
        }

        let segment = SharedSegment::create(dir, "docscan-ipc-", size_of::<RegionLayout>())
            .map_err(|e| WorkerError::RegionInit(e.to_string()))?;

        let layout = segment.as_ptr() as *mut RegionLayout;
        unsafe {
            ProcessMutex::init_in_place(addr_of_mut!((*layout).data))
                .and_then(|_| ProcessMutex::init_in_place(addr_of_mut!((*layout).queue_lock)))
                .and_then(|_| ProcessCondvar::init_in_place(addr_of_mut!((*layout).has_work)))
                .and_then(|_| ProcessCondvar::init_in_place(addr_of_mut!((*layout).done_working)))
                .and_then(|_| ProcessMutex::init_in_place(addr_of_mut!((*layout).slots)))
                .map_err(|e| WorkerError::RegionInit(e.to_string()))?;

            addr_of_mut!((*layout).header).write(RegionHeader {
                magic: REGION_MAGIC,
                version: REGION_VERSION,
                workers: workers as u32,
                _reserved: 0,
            });
        }

        let region = Self {
            inner: Arc::new(RegionInner {
                segment,
                owner: std::process::id(),
            }),
        };
        region.layout().data.lock().blob_capacity = blob_capacity;
        Ok(region)
    }

    fn layout(&self) -> &RegionLayout {
        unsafe { &*(self.inner.segment.as_ptr() as *const RegionLayout) }
    }

    /// Whether the header carries this build's magic and version
    pub fn is_compatible(&self) -> bool {
        let header = &self.layout().header;
        header.magic == REGION_MAGIC && header.version == REGION_VERSION
    }

    /// Number of worker slots
    pub fn worker_count(&self) -> usize {
        self.layout().header.workers as usize
    }

    /// Path of the backing segment
    pub fn path(&self) -> &Path {
        self.inner.segment.path()
    }

    // ---- queue bookkeeping -------------------------------------------------

    /// Serializes every statement against the durable queue
    pub(crate) fn lock_queue(&self) -> ProcessMutexGuard<'_, ()> {
        self.layout().queue_lock.lock()
    }

    /// A job was persisted
    pub(crate) fn job_pushed(&self) {
        let layout = self.layout();
        layout.data.lock().queued += 1;
        layout.has_work.notify_one();
    }

    /// A job was removed by a non-worker consumer
    pub(crate) fn job_taken(&self) {
        let layout = self.layout();
        let mut c = layout.data.lock();
        c.queued = (c.queued - 1).max(0);
        if c.queued == 0 && c.busy <= 0 {
            layout.done_working.notify_all();
        }
    }

    /// Overwrite the queued counter with a known row count
    pub(crate) fn set_queued(&self, n: u64) {
        let layout = self.layout();
        let mut c = layout.data.lock();
        c.queued = n as i64;
        if c.queued > 0 {
            layout.has_work.notify_all();
        } else if c.busy <= 0 {
            layout.done_working.notify_all();
        }
    }

    /// A worker took a job: move it from queued to busy in one step so the
    /// drain predicate never sees it in neither state.
    pub(crate) fn job_claimed(&self, slot: usize, path: &str) {
        let layout = self.layout();
        let mut c = layout.data.lock();
        c.queued = (c.queued - 1).max(0);
        c.busy += 1;

        let mut slots = layout.slots.lock();
        slots[slot].busy = true;
        slots[slot].set_path(path);
    }

    /// Record the job a worker is running outside the queue, so a crash
    /// is still attributed to it
    pub(crate) fn set_current_job(&self, slot: usize, path: &str) {
        self.layout().slots.lock()[slot].set_path(path);
    }

    /// A worker finished a job it ran inline without claiming it
    pub(crate) fn inline_job_finished(&self) {
        self.layout().data.lock().completed += 1;
    }

    /// A worker finished executing its claimed job
    pub(crate) fn job_finished(&self, slot: usize) {
        let layout = self.layout();
        let mut c = layout.data.lock();
        {
            let mut slots = layout.slots.lock();
            if !slots[slot].busy {
                return;
            }
            slots[slot].busy = false;
        }
        c.busy -= 1;
        c.completed += 1;
        if c.queued <= 0 && c.busy <= 0 {
            layout.done_working.notify_all();
        }
    }

    /// Release the busy slot of a crashed worker. Returns the path of the
    /// job it was running, if any.
    pub(crate) fn release_crashed(&self, slot: usize) -> Option<String> {
        let layout = self.layout();
        let mut c = layout.data.lock();
        c.crashed += 1;

        let mut slots = layout.slots.lock();
        let mut path = None;
        if slots[slot].busy {
            path = slots[slot].path();
            slots[slot].busy = false;
            c.busy -= 1;
        }
        slots[slot].pid = 0;
        drop(slots);

        if c.queued <= 0 && c.busy <= 0 {
            layout.done_working.notify_all();
        }
        path
    }

    /// Block in bounded slices until jobs are available or the pool stops.
    ///
    /// With `return_when_drained`, also returns once the producer is done
    /// and the queue is empty.
    pub(crate) fn await_jobs(&self, return_when_drained: bool) -> Availability {
        let layout = self.layout();
        let mut c = layout.data.lock();
        loop {
            if c.stop {
                return Availability::Stopped;
            }
            if c.queued > 0 {
                return Availability::Ready;
            }
            if return_when_drained && c.no_more_jobs {
                return Availability::Drained;
            }
            layout.has_work.wait_timeout(&mut c, WORK_WAIT_SLICE);
        }
    }

    /// Whether `stop` has been set
    pub fn is_stopped(&self) -> bool {
        self.layout().data.lock().stop
    }

    // ---- lifecycle ---------------------------------------------------------

    pub(crate) fn mark_initialized(&self) {
        self.layout().data.lock().initialized += 1;
    }

    /// Record that a worker hit an unrecoverable error
    pub(crate) fn mark_fatal(&self) {
        let layout = self.layout();
        layout.data.lock().fatal = true;
        layout.done_working.notify_all();
    }

    /// RUNNING → DRAINING: no more jobs will be produced
    pub(crate) fn begin_drain(&self) {
        let layout = self.layout();
        layout.data.lock().no_more_jobs = true;
        layout.has_work.notify_all();
    }

    /// Wait up to `timeout` on `done_working` and report the drain state
    pub(crate) fn wait_drained(&self, timeout: Duration) -> DrainStatus {
        let layout = self.layout();
        let mut c = layout.data.lock();

        let status = |c: &Counters| {
            if c.fatal {
                DrainStatus::Fatal
            } else if c.queued <= 0 && c.busy <= 0 {
                DrainStatus::Drained
            } else {
                DrainStatus::Pending
            }
        };

        match status(&*c) {
            DrainStatus::Pending => {
                layout.done_working.wait_timeout(&mut c, timeout);
                status(&*c)
            }
            done => done,
        }
    }

    /// DRAINING → STOPPED: tell every worker to leave its loop
    pub(crate) fn request_stop(&self) {
        let layout = self.layout();
        layout.data.lock().stop = true;
        layout.has_work.notify_all();
        layout.done_working.notify_all();
    }

    // ---- slot table --------------------------------------------------------

    /// Record the process running in `slot`. Busy state is left alone: the
    /// child may already have claimed a job.
    pub(crate) fn set_pid(&self, slot: usize, pid: i32) {
        self.layout().slots.lock()[slot].pid = pid;
    }

    /// Slot currently held by process `pid`
    pub fn slot_of(&self, pid: i32) -> Option<usize> {
        let slots = self.layout().slots.lock();
        slots[..self.worker_count()]
            .iter()
            .position(|s| s.pid == pid && pid != 0)
    }

    /// Path of the last job claimed in `slot`
    pub fn current_job(&self, slot: usize) -> Option<String> {
        self.layout().slots.lock()[slot].path()
    }

    /// Copy of all counters
    pub fn snapshot(&self) -> RegionSnapshot {
        let c = self.layout().data.lock();
        RegionSnapshot {
            queued: c.queued.max(0) as u64,
            busy: c.busy.max(0) as u64,
            completed: c.completed,
            initialized: c.initialized,
            crashed: c.crashed,
            blob_capacity: c.blob_capacity,
            no_more_jobs: c.no_more_jobs,
            stop: c.stop,
            fatal: c.fatal,
        }
    }
}

impl CapacityCell for CoordinationRegion {
    fn capacity(&self) -> u64 {
        self.layout().data.lock().blob_capacity
    }

    fn grow(&self, observed: u64, chunk: u64) -> u64 {
        let mut c = self.layout().data.lock();
        if c.blob_capacity <= observed {
            c.blob_capacity = observed + chunk;
        }
        c.blob_capacity
    }
}
