//! Incremental scans against a previous index
//!
//! Before the walk, every shard of the baseline index is read once into an
//! `inode → mtime` table. During the walk, files whose inode and mtime are
//! unchanged are not parsed; they are marked instead. After the pool drains,
//! the marked records are copied verbatim (with their blobs) into the new
//! index's `_index_original` shard. Baseline records whose inode was never
//! seen become [`ResultJob::delete`] jobs, which [`DeleteListWriter`]
//! appends to the `_delete` list.

use crate::error::{Result, ScanError, ShardError};
use crate::index::{
    list_shards, DocumentId, IndexDescriptor, ShardReader, ShardWriter, CARRIED_SHARD,
};
use crate::pool::{JobHandler, WorkerContext};
use crate::queue::{Job, ResultJob, ResultOp, StatSnapshot};
use crate::store::{BlobStore, BLOB_STORE_FILE};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Ids of baseline documents that no longer exist, one hex id per line
pub const DELETE_LIST_FILE: &str = "_delete";

/// Outcome of [`DiffEngine::copy_forward`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Records carried into the new index
    pub copied: u64,
    /// Blobs carried into the new blob store
    pub blobs: u64,
    /// Baseline records whose inode was not seen during the walk
    pub deleted: u64,
}

/// Diff state for one incremental scan
#[derive(Debug)]
pub struct DiffEngine {
    baseline: PathBuf,
    mtimes: HashMap<u64, i64>,
    copy: HashSet<u64>,
    seen: HashSet<u64>,
}

impl DiffEngine {
    /// Read every shard of the index at `baseline`
    pub fn load(baseline: &Path) -> Result<Self> {
        let descriptor = IndexDescriptor::read_compatible(baseline)?;

        let mut mtimes = HashMap::new();
        let mut records = 0u64;
        for shard in list_shards(baseline)? {
            for record in ShardReader::open(&shard)? {
                match record {
                    Ok(raw) => {
                        mtimes.insert(raw.header.inode, raw.header.mtime);
                        records += 1;
                    }
                    Err(e) => {
                        warn_damaged(&shard, &e);
                        break;
                    }
                }
            }
        }

        info!(
            baseline = %baseline.display(),
            index = %descriptor.id,
            records,
            inodes = mtimes.len(),
            "Loaded incremental baseline"
        );

        Ok(Self {
            baseline: baseline.to_path_buf(),
            mtimes,
            copy: HashSet::new(),
            seen: HashSet::new(),
        })
    }

    pub fn baseline(&self) -> &Path {
        &self.baseline
    }

    /// Distinct inodes in the baseline
    pub fn baseline_len(&self) -> usize {
        self.mtimes.len()
    }

    /// Inodes marked for copy-forward so far
    pub fn marked_len(&self) -> usize {
        self.copy.len()
    }

    /// Whether a walked file needs parsing. Unchanged files are marked for
    /// copy-forward and return `false`.
    pub fn should_parse(&mut self, stat: &StatSnapshot) -> bool {
        self.seen.insert(stat.inode);
        match self.mtimes.get(&stat.inode) {
            Some(&mtime) if mtime == stat.mtime => {
                self.copy.insert(stat.inode);
                false
            }
            _ => true,
        }
    }

    /// Copy marked records and their blobs into `out_dir`. Also returns
    /// the ids of baseline records whose inode disappeared.
    pub fn copy_forward(
        &self,
        out_dir: &Path,
        blobs: Option<&BlobStore>,
    ) -> Result<(CopyReport, Vec<DocumentId>)> {
        let mut report = CopyReport::default();
        let mut deleted = Vec::new();

        let source_blobs = match blobs {
            Some(_) if self.baseline.join(BLOB_STORE_FILE).is_file() => {
                Some(BlobStore::open_readonly(&self.baseline.join(BLOB_STORE_FILE))?)
            }
            _ => None,
        };

        let mut carried: Option<ShardWriter> = None;

        for shard in list_shards(&self.baseline)? {
            for record in ShardReader::open(&shard)? {
                let raw = match record {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn_damaged(&shard, &e);
                        break;
                    }
                };
                let inode = raw.header.inode;

                if self.copy.contains(&inode) {
                    let writer = match carried.take() {
                        Some(writer) => writer,
                        None => ShardWriter::open_path(out_dir.join(CARRIED_SHARD))?,
                    };
                    carried.insert(writer).append_raw(&raw)?;
                    report.copied += 1;

                    if let (Some(source), Some(dest)) = (&source_blobs, blobs) {
                        for (num, data) in source.read_all(&raw.header.id)? {
                            if dest.write(&raw.header.id, num, &data)? {
                                report.blobs += 1;
                            }
                        }
                    }
                } else if !self.seen.contains(&inode) {
                    deleted.push(raw.header.id);
                    report.deleted += 1;
                }
            }
        }

        if let Some(writer) = carried {
            writer.finish()?;
        }

        debug!(
            copied = report.copied,
            blobs = report.blobs,
            deleted = report.deleted,
            "Copy-forward finished"
        );
        Ok((report, deleted))
    }
}

/// Result-job handler appending deleted document ids to a `_delete` list,
/// one hex id per line
#[derive(Debug, Clone)]
pub struct DeleteListWriter {
    path: PathBuf,
}

impl DeleteListWriter {
    /// Start an empty list at `path`
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        File::create(&path).map_err(ShardError::Io)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobHandler for DeleteListWriter {
    fn handle(&self, job: Job, _ctx: &mut WorkerContext) -> Result<()> {
        let id = match job {
            Job::Result(ResultJob {
                doc_id,
                op: ResultOp::Delete,
                ..
            }) => doc_id,
            Job::Result(_) => return Err(ScanError::UnexpectedJob { kind: "insert" }),
            Job::Parse(_) => return Err(ScanError::UnexpectedJob { kind: "parse" }),
        };
        // One append-mode write per line keeps concurrent writers whole
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(ShardError::Io)?;
        file.write_all(format!("{id}\n").as_bytes())
            .map_err(ShardError::Io)?;
        Ok(())
    }
}

fn warn_damaged(shard: &Path, e: &ShardError) {
    warn!(
        shard = %shard.display(),
        error = %e,
        "Skipping rest of damaged shard"
    );
}
