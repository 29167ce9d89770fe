//! Job types carried by the durable queue

use crate::error::{QueueError, QueueResult};
use crate::index::document::{path_offsets, DocumentId};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

/// Discriminator stored alongside each queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Parse,
    Result,
}

impl JobKind {
    /// Value of the `kind` column
    pub fn code(self) -> i64 {
        match self {
            JobKind::Parse => 1,
            JobKind::Result => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JobKind::Parse => "parse",
            JobKind::Result => "result",
        }
    }
}

/// File attributes captured at walk time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub inode: u64,
    pub size: u64,
    /// Seconds since the epoch
    pub mtime: i64,
    pub mode: u32,
}

impl StatSnapshot {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            inode: meta.ino(),
            size: meta.size(),
            mtime: meta.mtime(),
            mode: meta.mode(),
        }
    }
}

/// Parse one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseJob {
    /// Absolute path
    #[serde(with = "path_bytes")]
    pub path: PathBuf,
    /// Offset of the file name within `path`
    pub base: usize,
    /// Offset of the extension within `path` (`path.len()` if none)
    pub ext: usize,
    pub stat: StatSnapshot,
    /// Document this file was extracted from (archive members)
    pub parent: Option<DocumentId>,
}

impl ParseJob {
    pub fn new(path: PathBuf, stat: StatSnapshot) -> Self {
        let (base, ext) = path_offsets(path.as_os_str().as_bytes());
        Self {
            path,
            base,
            ext,
            stat,
            parent: None,
        }
    }

    /// Mark as derived from `parent`
    pub fn with_parent(mut self, parent: DocumentId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// File name component
    pub fn file_name(&self) -> &OsStr {
        OsStr::from_bytes(&self.path.as_os_str().as_bytes()[self.base..])
    }

    /// Extension without the dot, if any
    pub fn extension(&self) -> Option<&OsStr> {
        let bytes = self.path.as_os_str().as_bytes();
        (self.ext < bytes.len()).then(|| OsStr::from_bytes(&bytes[self.ext..]))
    }
}

/// Insert or delete discriminator for result jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultOp {
    Insert,
    Delete,
}

/// Emit one result to a downstream consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultJob {
    pub doc_id: DocumentId,
    pub op: ResultOp,
    pub payload: Option<String>,
}

impl ResultJob {
    pub fn insert(doc_id: DocumentId, payload: String) -> Self {
        Self {
            doc_id,
            op: ResultOp::Insert,
            payload: Some(payload),
        }
    }

    pub fn delete(doc_id: DocumentId) -> Self {
        Self {
            doc_id,
            op: ResultOp::Delete,
            payload: None,
        }
    }
}

/// A unit of work on the durable queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    Parse(ParseJob),
    Result(ResultJob),
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::Parse(_) => JobKind::Parse,
            Job::Result(_) => JobKind::Result,
        }
    }

    /// Short description for crash diagnostics
    pub fn describe(&self) -> String {
        match self {
            Job::Parse(job) => job.path.to_string_lossy().into_owned(),
            Job::Result(job) => format!("result:{}", job.doc_id),
        }
    }

    pub fn encode(&self) -> QueueResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> QueueResult<Self> {
        bincode::deserialize(bytes).map_err(QueueError::from)
    }
}

impl From<ParseJob> for Job {
    fn from(job: ParseJob) -> Self {
        Job::Parse(job)
    }
}

impl From<ResultJob> for Job {
    fn from(job: ResultJob) -> Self {
        Job::Result(job)
    }
}

/// Paths as raw OS bytes so non-UTF-8 names survive the queue
mod path_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::ffi::OsString;
    use std::os::unix::ffi::{OsStrExt, OsStringExt};
    use std::path::{Path, PathBuf};

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(path.as_os_str().as_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(PathBuf::from(OsString::from_vec(bytes)))
    }
}
