//! docscan - Crash-Isolated File Crawler and Indexer
//!
//! Walks a directory tree and parses every regular file in a pool of worker
//! processes. A worker that segfaults on a malformed file takes only that
//! file with it: its supervisor forks a replacement and the scan goes on.
//!
//! # Features
//!
//! - **Durable Job Queue**: an SQLite file (on tmpfs when available) shared
//!   by every process, with a size cap and backoff when full.
//!
//! - **Shared Coordination Region**: process-shared mutexes and condition
//!   variables in an mmap'd file carry queue counters, per-slot state and
//!   the drain/stop protocol.
//!
//! - **Sharded Output**: each worker process appends records to its own
//!   `_index_<pid>` file, so no output lock is ever taken.
//!
//! - **Blob Store**: thumbnails keyed by document id in one SQLite store
//!   whose capacity grows in chunks agreed on by all workers.
//!
//! - **Incremental Scans**: files unchanged since a baseline index are not
//!   parsed again; their records are copied forward.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Parent process                           │
//! │                                                                  │
//! │   FileWalker ──push──┐        ┌── supervisor-0 ──fork/waitpid─┐  │
//! │                      ▼        ├── supervisor-1 ──fork/waitpid─┤  │
//! │              ┌──────────────┐ └── supervisor-N ──fork/waitpid─┤  │
//! │              │  JobQueue    │                                 │  │
//! │              │  (SQLite)    │   CoordinationRegion (mmap)     │  │
//! │              └──────┬───────┘   counters, slots, stop/fatal   │  │
//! └─────────────────────┼─────────────────────────────────────────┼──┘
//!                       │ claim                                   │
//!                       ▼                                         ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                   Worker processes (one per slot)                │
//! │   DocumentParser ──▶ _index_<pid> shard   ──▶ thumbs.db blobs    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Full scan
//! docscan /srv/files -o files.idx
//!
//! # Incremental scan against the previous index
//! docscan /srv/files -o files-2.idx --incremental files.idx
//!
//! # Inspect the records
//! docscan dump files.idx | head
//! ```

pub mod config;
pub mod error;
pub mod incremental;
pub mod index;
pub mod ipc;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod scan;
pub mod store;

pub use config::{CliArgs, ScanConfig};
pub use error::{Result, ScanError};
pub use scan::{ScanProgress, ScanResult, Scanner};
