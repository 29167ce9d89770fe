//! Shared blob store capacity

use std::sync::atomic::{AtomicU64, Ordering};

/// Single source of truth for the blob store's maximum size in bytes.
///
/// Implemented by the coordination region for multi-process pools and by
/// [`LocalCapacity`] for single-process use.
pub trait CapacityCell: Send + Sync {
    /// Current capacity in bytes
    fn capacity(&self) -> u64;

    /// Grow by `chunk` if capacity is still `observed`; returns the capacity
    /// after the call. A caller that observed a stale value gets the newer
    /// capacity without growing again.
    fn grow(&self, observed: u64, chunk: u64) -> u64;
}

/// In-process capacity cell
#[derive(Debug)]
pub struct LocalCapacity(AtomicU64);

impl LocalCapacity {
    pub fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }
}

impl CapacityCell for LocalCapacity {
    fn capacity(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn grow(&self, observed: u64, chunk: u64) -> u64 {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current <= observed).then_some(observed + chunk)
            });
        self.0.load(Ordering::SeqCst)
    }
}
