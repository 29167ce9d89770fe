//! Crash-isolated multi-process worker pool
//!
//! - `coordinator`: pool lifecycle, job intake and drain
//! - `supervisor`: one thread per slot that forks and reforks workers
//! - `worker`: the claim-and-handle loop running inside each child

mod coordinator;
mod supervisor;
mod worker;

pub use coordinator::{
    default_queue_dir, PoolConfig, PoolMonitor, PoolProgress, PoolReport, PoolState, WorkerPool,
    DEFAULT_MAX_QUEUE_BYTES,
};
pub use supervisor::{CrashReport, SupervisorEvent};
pub use worker::{JobHandler, WorkerContext, EXIT_FATAL};
