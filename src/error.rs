//! Error types for docscan
//!
//! This module defines the error hierarchy for the scan pipeline:
//! - Durable job queue errors (SQLite)
//! - Blob store errors, including capacity exhaustion
//! - Shard encoding/decoding errors
//! - Configuration and CLI errors
//! - Worker process and supervisor errors
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Separate "job failed" from "run must stop" (see [`ScanError::is_fatal`])
//! - Preserve error chains for debugging

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for docscan
#[derive(Error, Debug)]
pub enum ScanError {
    /// Job queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Blob store errors
    #[error("Blob store error: {0}")]
    Store(#[from] StoreError),

    /// Shard read/write errors
    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/supervisor errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors (reading source files, output directory, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors (descriptor, dump output)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A handler received a job kind it does not process
    #[error("Unexpected {kind} job")]
    UnexpectedJob { kind: &'static str },

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

impl ScanError {
    /// Whether this error must terminate the run.
    ///
    /// Queue, store, shard I/O and worker errors mean run-wide state can no
    /// longer be trusted. Everything else is scoped to the job that raised
    /// it and is logged by the worker loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            ScanError::Shard(ShardError::PathTooLong { .. } | ShardError::KindMismatch { .. }) => {
                false
            }
            ScanError::Queue(_)
            | ScanError::Store(_)
            | ScanError::Shard(_)
            | ScanError::Worker(_)
            | ScanError::Interrupted => true,
            _ => false,
        }
    }
}

/// Durable job queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to create the queue file
    #[error("Failed to create queue at '{path}': {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    /// Job payload could not be encoded or decoded
    #[error("Job serialization error: {0}")]
    Serialization(String),

    /// Job kind does not match the queue's kind
    #[error("Queue holds {expected} jobs, got a {found} job")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },

    /// The pool was stopped while a push was backing off
    #[error("Queue stopped while waiting for space")]
    Stopped,
}

impl From<bincode::Error> for QueueError {
    fn from(e: bincode::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// Blob store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to open the store
    #[error("Failed to open blob store at '{path}': {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    /// Store still full after growing once
    #[error("Blob store full writing {key} (capacity {capacity} bytes)")]
    Full { key: String, capacity: u64 },

    /// Write attempted on a read-only handle
    #[error("Blob store opened read-only")]
    ReadOnly,
}

/// Shard encoding/decoding errors
#[derive(Error, Debug)]
pub enum ShardError {
    /// I/O error on the shard file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record cut off before its terminator
    #[error("Truncated record at offset {offset}")]
    Truncated { offset: u64 },

    /// Meta tag byte that maps to no known key
    #[error("Unknown meta tag 0x{tag:02x} at offset {offset}")]
    UnknownTag { tag: u8, offset: u64 },

    /// Path does not fit the 16-bit offsets of the record header
    #[error("Path too long for shard record ({len} bytes)")]
    PathTooLong { len: usize },

    /// Meta value kind does not match its key
    #[error("Meta key {key} expects a {expected} value")]
    KindMismatch {
        key: &'static str,
        expected: &'static str,
    },
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid queue footprint
    #[error("Invalid queue size {mb} MiB: must be at least {min} MiB")]
    InvalidQueueSize { mb: u64, min: u64 },

    /// Invalid blob store sizing
    #[error("Invalid blob store size {mb} MiB: must be at least {min} MiB")]
    InvalidStoreSize { mb: u64, min: u64 },

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidExcludePattern { pattern: String, reason: String },

    /// Scan root missing or not a directory
    #[error("Invalid scan root '{path}': {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    /// Output path error
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutputPath { path: PathBuf, reason: String },

    /// Incremental baseline missing or unreadable
    #[error("Cannot scan incrementally from '{path}': {reason}")]
    InvalidBaseline { path: PathBuf, reason: String },

    /// Baseline written by an incompatible version
    #[error("Index at '{path}' has version {found}, expected {expected}")]
    IncompatibleVersion {
        path: PathBuf,
        found: String,
        expected: String,
    },
}

/// Worker process and supervisor errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// fork() failed
    #[error("Failed to fork worker {slot}: {reason}")]
    Fork { slot: usize, reason: String },

    /// waitpid() failed
    #[error("Failed to wait for worker {slot}: {reason}")]
    Wait { slot: usize, reason: String },

    /// Supervisor thread could not be started
    #[error("Failed to start supervisor {slot}: {reason}")]
    SpawnFailed { slot: usize, reason: String },

    /// Supervisor thread panicked
    #[error("Supervisor {slot} panicked")]
    Panicked { slot: usize },

    /// Worker exited after an unrecoverable error
    #[error("Worker {slot} exited with fatal status {code}")]
    Fatal { slot: usize, code: i32 },

    /// Coordination region could not be created
    #[error("Failed to create coordination region: {0}")]
    RegionInit(String),

    /// Every supervisor ended while work was outstanding
    #[error("All workers have terminated unexpectedly")]
    AllWorkersDead,

    /// Operation not allowed in the pool's current state
    #[error("Cannot {operation} a pool that is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

/// Result type alias for ScanError
pub type Result<T> = std::result::Result<T, ScanError>;

/// Result type alias for QueueError
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type alias for StoreError
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for ShardError
pub type ShardResult<T> = std::result::Result<T, ShardError>;
