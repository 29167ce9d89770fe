//! Content-addressed blob store for thumbnails and other binary artifacts
//!
//! Blobs are keyed by `(DocumentId, sub-index)`. Capacity is a shared value
//! (see [`CapacityCell`]) so every worker process sees the same limit and
//! growth done by one process is picked up by the others.

mod blob;
mod capacity;

pub use blob::{
    BlobStore, BlobStoreConfig, BLOB_STORE_FILE, DEFAULT_GROWTH_CHUNK, DEFAULT_INITIAL_CAPACITY,
};
pub use capacity::{CapacityCell, LocalCapacity};
