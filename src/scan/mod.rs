//! Scan orchestration
//!
//! A scan ties the pieces together:
//!
//! ```text
//!   FileWalker ──ParseJob──▶ JobQueue ──claim──▶ worker processes
//!       │                                          │  DocumentParser
//!       │ unchanged (incremental)                  ├─▶ _index_<pid> shards
//!       ▼                                          └─▶ thumbs.db
//!   DiffEngine ──copy_forward──▶ _index_original
//!       │ vanished ids
//!       ▼
//!   ResultJob::delete ──▶ result pool ──▶ DeleteListWriter ──▶ _delete
//! ```
//!
//! - `walk`: local directory traversal
//! - `mime`: mime codes by extension
//! - `parse`: the job handler run inside workers

pub mod mime;
pub mod parse;
pub mod walk;

pub use parse::{BasicExtractor, DocumentParser, Extractor};
pub use walk::{FileWalker, WalkMonitor, WalkStats, WalkedFile};

use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::incremental::{CopyReport, DeleteListWriter, DiffEngine, DELETE_LIST_FILE};
use crate::index::{list_shards, DocumentId, IndexDescriptor};
use crate::pool::{PoolConfig, PoolProgress, PoolReport, WorkerPool};
use crate::queue::{JobKind, ParseJob, ResultJob};
use crate::store::{BlobStore, BlobStoreConfig, LocalCapacity, BLOB_STORE_FILE};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How often the progress callback runs
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Live scan status passed to the progress callback
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub walk: WalkStats,
    /// Files left unparsed because the baseline has them unchanged
    pub skipped: u64,
    pub pool: PoolProgress,
}

/// Outcome of a completed scan
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub walk: WalkStats,
    pub skipped: u64,
    pub pool: PoolReport,
    /// Present for incremental scans
    pub copied: Option<CopyReport>,
    /// Shard files in the output directory
    pub shards: usize,
    pub duration: Duration,
}

/// Runs one scan from a validated [`ScanConfig`]
pub struct Scanner {
    config: ScanConfig,
    interrupt: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Setting this flag stops the walk and the pool
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn run(&self) -> Result<ScanResult> {
        self.run_with_progress(|_| {})
    }

    /// Run the scan, calling `on_progress` periodically from a monitor
    /// thread and once more at the end
    pub fn run_with_progress<F>(&self, on_progress: F) -> Result<ScanResult>
    where
        F: Fn(&ScanProgress) + Sync,
    {
        let config = &self.config;
        let start = Instant::now();

        // Never reuse an existing index directory
        fs::create_dir(&config.output)?;
        let descriptor = IndexDescriptor::new(&config.root, &config.name);
        descriptor.write(&config.output)?;
        info!(
            root = %config.root.display(),
            output = %config.output.display(),
            index = %descriptor.id,
            workers = config.workers,
            "Starting scan"
        );

        let mut diff = config
            .incremental
            .as_deref()
            .map(DiffEngine::load)
            .transpose()?;

        let blob_config = BlobStoreConfig {
            path: config.output.join(BLOB_STORE_FILE),
            initial_capacity: config.store_initial_bytes,
            growth_chunk: config.store_chunk_bytes,
        };
        let pool_config = PoolConfig::new(config.workers, JobKind::Parse)
            .with_queue_dir(&config.queue_dir)
            .with_max_queue_bytes(config.max_queue_bytes)
            .with_shard_dir(&config.output)
            .with_blob_store(blob_config.clone());
        let handler = Arc::new(DocumentParser::new(
            &config.root,
            BasicExtractor {
                content_size: config.content_size,
                thumbnail_max: config.thumbnail_max_bytes,
            },
        ));

        let mut pool =
            WorkerPool::create(pool_config, handler)?.with_interrupt_flag(self.interrupt_flag());
        pool.start()?;

        let walker = FileWalker::new(&config.root)
            .with_max_depth(config.max_depth)
            .with_excludes(config.exclude_patterns.clone());
        let walk_monitor = walker.monitor();
        let pool_monitor = pool.monitor();
        let skipped = AtomicU64::new(0);
        let done = AtomicBool::new(false);

        let progress = || ScanProgress {
            walk: walk_monitor.stats(),
            skipped: skipped.load(Ordering::Relaxed),
            pool: pool_monitor.progress(),
        };

        let outcome = thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    on_progress(&progress());
                    thread::sleep(PROGRESS_INTERVAL);
                }
            });

            let walked = walker.walk(|file| {
                if self.interrupt.load(Ordering::Relaxed) {
                    return Err(ScanError::Interrupted);
                }
                if let Some(diff) = diff.as_mut() {
                    if !diff.should_parse(&file.stat) {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                }
                pool.push(ParseJob::new(file.path, file.stat))
            });

            let outcome = match walked {
                Ok(stats) => pool.wait().map(|report| (stats, report)),
                Err(ScanError::Interrupted) => {
                    drop(pool);
                    Err(ScanError::Interrupted)
                }
                // A failed push usually means the pool hit a fatal error;
                // report that one instead
                Err(e) => pool.wait().and(Err(e)),
            };
            done.store(true, Ordering::Relaxed);
            outcome
        });
        let (walk, report) = outcome?;
        on_progress(&progress());

        let copied = match &diff {
            Some(diff) => {
                let store = BlobStore::open(
                    &blob_config,
                    Arc::new(LocalCapacity::new(report.snapshot.blob_capacity)),
                )?;
                let (copied, deleted) = diff.copy_forward(&config.output, Some(&store))?;
                drop(store);
                self.emit_deletions(deleted)?;
                Some(copied)
            }
            None => None,
        };

        let result = ScanResult {
            walk,
            skipped: skipped.load(Ordering::Relaxed),
            shards: list_shards(&config.output)?.len(),
            pool: report,
            copied,
            duration: start.elapsed(),
        };
        debug!(
            files = result.walk.files,
            skipped = result.skipped,
            completed = result.pool.completed,
            crashes = result.pool.crashes.len(),
            shards = result.shards,
            "Scan finished"
        );
        Ok(result)
    }

    /// List vanished baseline ids in `_delete` through a result-job pool
    fn emit_deletions(&self, deleted: Vec<DocumentId>) -> Result<()> {
        let config = &self.config;
        let list = DeleteListWriter::create(config.output.join(DELETE_LIST_FILE))?;
        if deleted.is_empty() {
            return Ok(());
        }

        let pool_config = PoolConfig::new(1, JobKind::Result)
            .with_queue_dir(&config.queue_dir)
            .with_max_queue_bytes(config.max_queue_bytes);
        let mut pool = WorkerPool::create(pool_config, Arc::new(list))?
            .with_interrupt_flag(self.interrupt_flag());
        pool.start()?;

        let pushed = deleted
            .into_iter()
            .try_for_each(|id| pool.push(ResultJob::delete(id)));
        let report = match pushed {
            Ok(()) => pool.wait()?,
            Err(e) => return pool.wait().and(Err(e)),
        };
        debug!(deleted = report.completed, "Listed deleted documents");
        Ok(())
    }
}
