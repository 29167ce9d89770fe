//! Cross-process coordination primitives
//!
//! - `segment`: file-backed shared memory mapping
//! - `sync`: process-shared robust mutex and condition variable
//! - `region`: the coordination record used by the worker pool

pub mod region;
pub mod segment;
pub mod sync;

pub use region::{Availability, CoordinationRegion, DrainStatus, RegionSnapshot, MAX_WORKERS};
pub use segment::SharedSegment;
pub use sync::{ProcessCondvar, ProcessMutex, ProcessMutexGuard};
