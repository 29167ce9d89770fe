//! Configuration types for docscan
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation

use crate::error::ConfigError;
use crate::ipc::MAX_WORKERS;
use crate::pool::default_queue_dir;
use clap::Parser;
use regex::Regex;
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

/// Smallest accepted queue cap
const MIN_QUEUE_MB: u64 = 1;

/// Smallest accepted blob store size and growth chunk
const MIN_STORE_MB: u64 = 1;

/// Crash-isolated file crawler writing a sharded binary index
#[derive(Parser, Debug, Clone)]
#[command(
    name = "docscan",
    version,
    about = "Crash-isolated file crawler writing a sharded binary index",
    long_about = "Walks a directory tree and parses every regular file in a pool of worker \
                  processes. Each worker appends document records to its own shard in the \
                  output directory; thumbnails go to a shared blob store.\n\n\
                  A worker that crashes on a file is replaced and the scan continues.",
    after_help = "EXAMPLES:\n    \
        docscan /srv/files -o files.idx\n    \
        docscan /srv/files -o files-2.idx --incremental files.idx\n    \
        docscan /data -t 16 --exclude '\\.git/' --depth 10\n    \
        docscan dump files.idx | head",
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
pub struct CliArgs {
    /// Directory to scan
    #[arg(value_name = "ROOT")]
    pub root: Option<PathBuf>,

    /// Subcommand (dump)
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Output index directory
    #[arg(short, long, default_value = "index.docscan", value_name = "DIR")]
    pub output: PathBuf,

    /// Index name stored in the descriptor (defaults to the root's file name)
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Number of worker processes
    #[arg(short = 't', long, default_value_t = default_workers(), value_name = "NUM")]
    pub threads: usize,

    /// Maximum size of the job queue file in MiB
    #[arg(long, default_value = "256", value_name = "MB")]
    pub max_queue_mb: u64,

    /// Initial blob store capacity in MiB
    #[arg(long, default_value = "5", value_name = "MB")]
    pub store_initial_mb: u64,

    /// Blob store growth step in MiB
    #[arg(long, default_value = "50", value_name = "MB")]
    pub store_chunk_mb: u64,

    /// Previous index to scan incrementally against
    #[arg(long, value_name = "DIR")]
    pub incremental: Option<PathBuf>,

    /// Exclude paths matching pattern (can be repeated)
    #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Maximum directory depth (unlimited if not set)
    #[arg(short = 'd', long, value_name = "NUM")]
    pub depth: Option<usize>,

    /// Bytes of text content kept per document (0 disables)
    #[arg(long, default_value = "4096", value_name = "BYTES")]
    pub content_size: usize,

    /// Largest image stored as a thumbnail, in KiB
    #[arg(long, default_value = "512", value_name = "KB")]
    pub thumbnail_max_kb: u64,

    /// Directory for the job queue and coordination files
    #[arg(long, value_name = "DIR")]
    pub queue_dir: Option<PathBuf>,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Print every document of an index as JSON lines
    Dump {
        /// Index directory
        #[arg(value_name = "INDEX_DIR")]
        index: PathBuf,
    },
}

/// Default worker count: one per CPU core
pub fn default_workers() -> usize {
    num_cpus::get().clamp(1, MAX_WORKERS)
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Directory being scanned (canonical)
    pub root: PathBuf,

    /// Output index directory
    pub output: PathBuf,

    /// Index name for the descriptor
    pub name: String,

    /// Number of worker processes
    pub workers: usize,

    /// Queue file cap in bytes
    pub max_queue_bytes: u64,

    /// Initial blob store capacity in bytes
    pub store_initial_bytes: u64,

    /// Blob store growth chunk in bytes
    pub store_chunk_bytes: u64,

    /// Baseline index for incremental scans
    pub incremental: Option<PathBuf>,

    /// Compiled exclude patterns
    pub exclude_patterns: Vec<Regex>,

    /// Maximum traversal depth
    pub max_depth: Option<usize>,

    /// Text content kept per document
    pub content_size: usize,

    /// Largest image kept as a thumbnail
    pub thumbnail_max_bytes: u64,

    /// Where the queue file and region live
    pub queue_dir: PathBuf,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl ScanConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let root = args.root.as_ref().ok_or_else(|| ConfigError::InvalidRoot {
            path: PathBuf::new(),
            reason: "a directory to scan is required".to_string(),
        })?;
        if !root.is_dir() {
            return Err(ConfigError::InvalidRoot {
                path: root.clone(),
                reason: "not a directory".to_string(),
            });
        }
        let root = root.canonicalize().map_err(|e| ConfigError::InvalidRoot {
            path: root.clone(),
            reason: e.to_string(),
        })?;

        // Validate worker count
        if args.threads == 0 || args.threads > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: args.threads,
                max: MAX_WORKERS,
            });
        }

        if args.max_queue_mb < MIN_QUEUE_MB {
            return Err(ConfigError::InvalidQueueSize {
                mb: args.max_queue_mb,
                min: MIN_QUEUE_MB,
            });
        }
        for mb in [args.store_initial_mb, args.store_chunk_mb] {
            if mb < MIN_STORE_MB {
                return Err(ConfigError::InvalidStoreSize {
                    mb,
                    min: MIN_STORE_MB,
                });
            }
        }

        // Compile exclude patterns
        let exclude_patterns = args
            .exclude_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidExcludePattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Validate baseline path if provided
        if let Some(baseline) = &args.incremental {
            if !baseline.is_dir() {
                return Err(ConfigError::InvalidBaseline {
                    path: baseline.clone(),
                    reason: "baseline index does not exist".to_string(),
                });
            }
            if same_dir(baseline, &args.output) {
                return Err(ConfigError::InvalidBaseline {
                    path: baseline.clone(),
                    reason: "baseline and output must be different directories".to_string(),
                });
            }
        }

        // Validate output path: a scan never writes into an existing index
        if args.output.symlink_metadata().is_ok() {
            return Err(ConfigError::InvalidOutputPath {
                path: args.output.clone(),
                reason: "already exists".to_string(),
            });
        }
        if let Some(parent) = args.output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidOutputPath {
                    path: args.output.clone(),
                    reason: format!("Parent directory '{}' does not exist", parent.display()),
                });
            }
        }

        let queue_dir = args.queue_dir.clone().unwrap_or_else(default_queue_dir);
        if !queue_dir.is_dir() {
            return Err(ConfigError::InvalidOutputPath {
                path: queue_dir,
                reason: "queue directory does not exist".to_string(),
            });
        }

        let name = args.name.clone().unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string())
        });

        Ok(Self {
            root,
            output: args.output,
            name,
            workers: args.threads,
            max_queue_bytes: args.max_queue_mb * MIB,
            store_initial_bytes: args.store_initial_mb * MIB,
            store_chunk_bytes: args.store_chunk_mb * MIB,
            incremental: args.incremental,
            exclude_patterns,
            max_depth: args.depth,
            content_size: args.content_size,
            thumbnail_max_bytes: args.thumbnail_max_kb * 1024,
            queue_dir,
            show_progress: !args.quiet,
            verbose: args.verbose,
        })
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
