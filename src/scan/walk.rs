//! Local directory traversal feeding the job queue

use crate::error::Result;
use crate::queue::StatSnapshot;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A regular file found by the walk
#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub path: PathBuf,
    pub stat: StatSnapshot,
}

/// Result from a walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
    pub excluded: u64,
    pub errors: u64,
}

/// Live counters, readable while the walk runs
#[derive(Debug, Default)]
struct Counters {
    dirs: AtomicU64,
    files: AtomicU64,
    bytes: AtomicU64,
    excluded: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WalkStats {
        WalkStats {
            dirs: self.dirs.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            excluded: self.excluded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle for reading walk progress from another thread
#[derive(Debug, Clone)]
pub struct WalkMonitor(Arc<Counters>);

impl WalkMonitor {
    pub fn stats(&self) -> WalkStats {
        self.0.snapshot()
    }
}

/// Depth-first walker over a local directory tree.
///
/// Symlinks are not followed. Only regular files are reported; entries
/// matching an exclude pattern are skipped along with everything below them.
pub struct FileWalker {
    root: PathBuf,
    max_depth: Option<usize>,
    excludes: Vec<Regex>,
    counters: Arc<Counters>,
}

impl FileWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_depth: None,
            excludes: Vec::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_excludes(mut self, patterns: Vec<Regex>) -> Self {
        self.excludes = patterns;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn monitor(&self) -> WalkMonitor {
        WalkMonitor(Arc::clone(&self.counters))
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if self.excludes.is_empty() {
            return false;
        }
        let path = path.to_string_lossy();
        self.excludes.iter().any(|re| re.is_match(&path))
    }

    /// Walk the tree, calling `on_file` for every regular file.
    ///
    /// Unreadable entries are logged and counted. An error returned by
    /// `on_file` stops the walk and is returned.
    pub fn walk<F>(&self, mut on_file: F) -> Result<WalkStats>
    where
        F: FnMut(WalkedFile) -> Result<()>,
    {
        let counters = &self.counters;
        let mut walker = WalkDir::new(&self.root).follow_links(false);
        if let Some(depth) = self.max_depth {
            walker = walker.max_depth(depth);
        }

        let entries = walker.into_iter().filter_entry(|entry| {
            // Never exclude the root itself
            if entry.depth() > 0 && self.is_excluded(entry.path()) {
                counters.excluded.fetch_add(1, Ordering::Relaxed);
                false
            } else {
                true
            }
        });

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                        error = %e,
                        "Failed to read directory entry"
                    );
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                counters.dirs.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to stat file");
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let stat = StatSnapshot::from_metadata(&metadata);
            counters.files.fetch_add(1, Ordering::Relaxed);
            counters.bytes.fetch_add(stat.size, Ordering::Relaxed);

            on_file(WalkedFile {
                path: entry.into_path(),
                stat,
            })?;
        }

        let stats = counters.snapshot();
        debug!(
            root = %self.root.display(),
            files = stats.files,
            dirs = stats.dirs,
            excluded = stats.excluded,
            errors = stats.errors,
            "Walk finished"
        );
        Ok(stats)
    }
}
