//! Per-worker append-only shard files
//!
//! Each worker process writes to `_index_<pid>` in the output directory.
//! Only that process ever opens its shard for writing, so appends need no
//! locking. A record is:
//!
//! ```text
//! id[16] | inode u64 | size u64 | mime u32 | mtime i64 | base u16 | ext u16
//! path \0
//! { tag u8, (i32 | i64 | string \0) }*
//! \n
//! ```
//!
//! Integers are in native byte order.

use crate::error::{ShardError, ShardResult};
use crate::index::document::{Document, DocumentId, MetaKey, MetaKind, MetaLine, MetaValue};
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name prefix shared by every shard
pub const SHARD_PREFIX: &str = "_index_";

/// Shard that receives records carried forward from a baseline
pub const CARRIED_SHARD: &str = "_index_original";

/// Size of the fixed record header
pub const RECORD_HEADER_LEN: usize = 48;

const RECORD_END: u8 = b'\n';

/// Shard path for process `pid` in `dir`
pub fn shard_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{}{}", SHARD_PREFIX, pid))
}

/// All shard files in `dir`, sorted by name
pub fn list_shards(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_shard = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(SHARD_PREFIX))
            .unwrap_or(false);
        if is_shard && entry.file_type()?.is_file() {
            shards.push(entry.path());
        }
    }
    shards.sort();
    Ok(shards)
}

/// Fixed-size record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub id: DocumentId,
    pub inode: u64,
    pub size: u64,
    pub mime: u32,
    pub mtime: i64,
    pub base: u16,
    pub ext: u16,
}

impl RecordHeader {
    fn of(doc: &Document) -> Self {
        Self {
            id: doc.id,
            inode: doc.inode,
            size: doc.size,
            mime: doc.mime,
            mtime: doc.mtime,
            base: doc.base,
            ext: doc.ext,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.inode.to_ne_bytes());
        buf.extend_from_slice(&self.size.to_ne_bytes());
        buf.extend_from_slice(&self.mime.to_ne_bytes());
        buf.extend_from_slice(&self.mtime.to_ne_bytes());
        buf.extend_from_slice(&self.base.to_ne_bytes());
        buf.extend_from_slice(&self.ext.to_ne_bytes());
    }

    fn decode(bytes: &[u8; RECORD_HEADER_LEN]) -> Self {
        let field = |from: usize, len: usize| &bytes[from..from + len];
        let mut id = [0u8; 16];
        id.copy_from_slice(field(0, 16));
        Self {
            id: DocumentId::from_bytes(id),
            inode: u64::from_ne_bytes(field(16, 8).try_into().unwrap_or_default()),
            size: u64::from_ne_bytes(field(24, 8).try_into().unwrap_or_default()),
            mime: u32::from_ne_bytes(field(32, 4).try_into().unwrap_or_default()),
            mtime: i64::from_ne_bytes(field(36, 8).try_into().unwrap_or_default()),
            base: u16::from_ne_bytes(field(44, 2).try_into().unwrap_or_default()),
            ext: u16::from_ne_bytes(field(46, 2).try_into().unwrap_or_default()),
        }
    }
}

/// Encode a full record into `buf`
pub fn encode_document(doc: &Document, buf: &mut Vec<u8>) {
    RecordHeader::of(doc).encode_into(buf);
    buf.extend_from_slice(doc.path.as_os_str().as_bytes());
    buf.push(0);
    for line in &doc.meta {
        line.encode_into(buf);
    }
    buf.push(RECORD_END);
}

/// A record read back from a shard, with its exact on-disk bytes
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub header: RecordHeader,
    path: PathBuf,
    meta: Vec<MetaLine>,
    bytes: Vec<u8>,
}

impl RawRecord {
    /// Exact bytes as found in the shard
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decoded document
    pub fn to_document(&self) -> Document {
        Document {
            id: self.header.id,
            inode: self.header.inode,
            size: self.header.size,
            mime: self.header.mime,
            mtime: self.header.mtime,
            path: self.path.clone(),
            base: self.header.base,
            ext: self.header.ext,
            meta: self.meta.clone(),
        }
    }
}

/// Append-only writer for one shard
pub struct ShardWriter {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    records: u64,
}

impl ShardWriter {
    /// Open the shard of the current process in `dir`
    pub fn open(dir: &Path) -> ShardResult<Self> {
        Self::open_path(shard_path(dir, std::process::id()))
    }

    /// Open (or create) a shard at an explicit path for appending
    pub fn open_path(path: PathBuf) -> ShardResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "Shard opened");
        Ok(Self {
            file,
            path,
            buf: Vec::with_capacity(4096),
            records: 0,
        })
    }

    /// Append one document as a single write
    pub fn append(&mut self, doc: &Document) -> ShardResult<()> {
        self.buf.clear();
        encode_document(doc, &mut self.buf);
        self.file.write_all(&self.buf)?;
        self.records += 1;
        Ok(())
    }

    /// Append a record verbatim
    pub fn append_raw(&mut self, record: &RawRecord) -> ShardResult<()> {
        self.file.write_all(record.as_bytes())?;
        self.records += 1;
        Ok(())
    }

    /// Records written through this handle
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close, returning the number of records written
    pub fn finish(mut self) -> ShardResult<u64> {
        self.file.flush()?;
        debug!(path = %self.path.display(), records = self.records, "Shard closed");
        Ok(self.records)
    }
}

/// Sequential reader over a shard
pub struct ShardReader<R> {
    reader: R,
    offset: u64,
    done: bool,
}

impl ShardReader<BufReader<File>> {
    pub fn open(path: &Path) -> ShardResult<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> ShardReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            done: false,
        }
    }

    /// Byte offset of the next record
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record, `None` at a clean end of file
    pub fn next_record(&mut self) -> ShardResult<Option<RawRecord>> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let start = self.offset;
        let mut bytes = Vec::with_capacity(256);

        let mut header = [0u8; RECORD_HEADER_LEN];
        self.read_exact(&mut header, start)?;
        bytes.extend_from_slice(&header);
        let header = RecordHeader::decode(&header);

        let path_bytes = self.read_cstr(&mut bytes, start)?;
        let path = PathBuf::from(OsStr::from_bytes(path_bytes));

        let mut meta = Vec::new();
        loop {
            let mut tag = [0u8; 1];
            self.read_exact(&mut tag, start)?;
            bytes.push(tag[0]);
            if tag[0] == RECORD_END {
                break;
            }

            let key = MetaKey::from_tag(tag[0]).ok_or(ShardError::UnknownTag {
                tag: tag[0],
                offset: start + bytes.len() as u64 - 1,
            })?;
            let value = match key.kind() {
                MetaKind::Int => {
                    let mut v = [0u8; 4];
                    self.read_exact(&mut v, start)?;
                    bytes.extend_from_slice(&v);
                    MetaValue::Int(i32::from_ne_bytes(v))
                }
                MetaKind::Long => {
                    let mut v = [0u8; 8];
                    self.read_exact(&mut v, start)?;
                    bytes.extend_from_slice(&v);
                    MetaValue::Long(i64::from_ne_bytes(v))
                }
                MetaKind::Str => {
                    let s = self.read_cstr(&mut bytes, start)?;
                    MetaValue::Str(String::from_utf8_lossy(s).into_owned())
                }
            };
            meta.push(MetaLine::new(key, value)?);
        }

        Ok(Some(RawRecord {
            header,
            path,
            meta,
            bytes,
        }))
    }

    fn read_exact(&mut self, buf: &mut [u8], record_start: u64) -> ShardResult<()> {
        match self.reader.read_exact(buf) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ShardError::Truncated {
                offset: record_start,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a NUL-terminated string, appending it (with the NUL) to `bytes`.
    /// Returns the string without its terminator.
    fn read_cstr<'b>(&mut self, bytes: &'b mut Vec<u8>, record_start: u64) -> ShardResult<&'b [u8]> {
        let from = bytes.len();
        let n = self.reader.read_until(0, bytes)?;
        self.offset += n as u64;
        if n == 0 || bytes.last() != Some(&0) {
            return Err(ShardError::Truncated {
                offset: record_start,
            });
        }
        Ok(&bytes[from..bytes.len() - 1])
    }
}

impl<R: BufRead> Iterator for ShardReader<R> {
    type Item = ShardResult<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read every document of one shard
pub fn read_documents(path: &Path) -> ShardResult<Vec<Document>> {
    ShardReader::open(path)?
        .map(|r| r.map(|raw| raw.to_document()))
        .collect()
}
