//! Turning parse jobs into document records
//!
//! [`DocumentParser`] is the [`JobHandler`] run inside every worker process.
//! It builds the record common to every file (id, stat fields, mime) and
//! hands type-specific work to an [`Extractor`].

use crate::error::{Result, ScanError};
use crate::index::{Document, DocumentId, MetaKey, MetaLine, MetaValue};
use crate::pool::{JobHandler, WorkerContext};
use crate::queue::{Job, ParseJob};
use crate::scan::mime::{self, MajorMime, MIME_EMPTY};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use tracing::trace;

/// Default bytes of text kept per document
pub const DEFAULT_CONTENT_SIZE: usize = 4096;

/// Default largest image stored as a thumbnail
pub const DEFAULT_THUMBNAIL_MAX: u64 = 512 * 1024;

/// Blob sub-index of a document's thumbnail
pub const THUMBNAIL_BLOB: u32 = 0;

/// Type-specific content extraction
pub trait Extractor: Send + Sync + 'static {
    /// Add meta lines (and blobs) for `job` to `doc`
    fn extract(&self, job: &ParseJob, doc: &mut Document, ctx: &mut WorkerContext) -> Result<()>;
}

/// Minimal extractor: leading text of text files, raw bytes of small images
#[derive(Debug, Clone, Copy)]
pub struct BasicExtractor {
    pub content_size: usize,
    pub thumbnail_max: u64,
}

impl Default for BasicExtractor {
    fn default() -> Self {
        Self {
            content_size: DEFAULT_CONTENT_SIZE,
            thumbnail_max: DEFAULT_THUMBNAIL_MAX,
        }
    }
}

impl BasicExtractor {
    fn extract_text(&self, job: &ParseJob, doc: &mut Document) -> Result<()> {
        if self.content_size == 0 {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(self.content_size.min(job.stat.size as usize));
        File::open(&job.path)?
            .take(self.content_size as u64)
            .read_to_end(&mut buf)?;

        let text = leading_text(&buf);
        let text = text.trim_end();
        if !text.is_empty() {
            doc.push_meta(MetaLine::text(MetaKey::Content, text)?);
        }
        Ok(())
    }

    fn extract_thumbnail(
        &self,
        job: &ParseJob,
        doc: &mut Document,
        ctx: &mut WorkerContext,
    ) -> Result<()> {
        if job.stat.size > self.thumbnail_max {
            return Ok(());
        }
        let bytes = std::fs::read(&job.path)?;
        ctx.write_blob(&doc.id, THUMBNAIL_BLOB, &bytes)?;
        doc.push_meta(MetaLine::new(MetaKey::Thumbnail, MetaValue::Int(1))?);
        Ok(())
    }
}

impl Extractor for BasicExtractor {
    fn extract(&self, job: &ParseJob, doc: &mut Document, ctx: &mut WorkerContext) -> Result<()> {
        match mime::major(doc.mime) {
            MajorMime::Text => self.extract_text(job, doc),
            MajorMime::Image => self.extract_thumbnail(job, doc, ctx),
            _ => Ok(()),
        }
    }
}

/// UTF-8 prefix of `buf`. A multi-byte character cut off by the read limit
/// is dropped; invalid sequences elsewhere are replaced.
fn leading_text(buf: &[u8]) -> String {
    match std::str::from_utf8(buf) {
        Ok(s) => s.to_string(),
        Err(e) if e.error_len().is_none() => {
            String::from_utf8_lossy(&buf[..e.valid_up_to()]).into_owned()
        }
        Err(_) => String::from_utf8_lossy(buf).into_owned(),
    }
}

/// Mime code from the first bytes of the file, 0 if unrecognized
fn sniff(job: &ParseJob) -> Result<u32> {
    let mut header = Vec::with_capacity(mime::SNIFF_LEN);
    File::open(&job.path)?
        .take(mime::SNIFF_LEN as u64)
        .read_to_end(&mut header)?;
    Ok(mime::mime_by_content(&header).unwrap_or(0))
}

/// Job handler writing one document per parse job
pub struct DocumentParser<E> {
    root: PathBuf,
    extractor: E,
}

impl<E: Extractor> DocumentParser<E> {
    /// Parser for files under `root`; record paths are stored relative to it
    pub fn new(root: impl Into<PathBuf>, extractor: E) -> Self {
        Self {
            root: root.into(),
            extractor,
        }
    }

    /// Build the record for `job`, running the extractor when the type
    /// is worth reading
    pub fn parse(&self, job: &ParseJob, ctx: &mut WorkerContext) -> Result<Document> {
        let rel = job
            .path
            .strip_prefix(&self.root)
            .unwrap_or(&job.path)
            .to_path_buf();

        let mime = if job.stat.size == 0 {
            MIME_EMPTY
        } else {
            match job
                .extension()
                .and_then(|ext| ext.to_str())
                .and_then(mime::mime_by_extension)
            {
                Some(code) => code,
                None => sniff(job)?,
            }
        };

        let mut doc = Document::new(
            DocumentId::random(),
            rel,
            job.stat.inode,
            job.stat.size,
            job.stat.mtime,
            mime,
        )?;

        if mime::should_parse(mime) {
            self.extractor.extract(job, &mut doc, ctx)?;
        }

        if let Some(parent) = &job.parent {
            doc.push_meta(MetaLine::text(MetaKey::Parent, parent.to_string())?);
        }
        Ok(doc)
    }
}

impl<E: Extractor> JobHandler for DocumentParser<E> {
    fn handle(&self, job: Job, ctx: &mut WorkerContext) -> Result<()> {
        let job = match job {
            Job::Parse(job) => job,
            Job::Result(_) => return Err(ScanError::UnexpectedJob { kind: "result" }),
        };

        let doc = self.parse(&job, ctx)?;
        trace!(path = %doc.path.display(), mime = doc.mime, "Parsed");
        ctx.write_document(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::shard::read_documents;
    use crate::ipc::CoordinationRegion;
    use crate::queue::{queue_file_name, JobKind, JobQueue, ResultJob, StatSnapshot};
    use crate::store::{BlobStore, BlobStoreConfig, LocalCapacity, BLOB_STORE_FILE};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn context(dir: &Path) -> (CoordinationRegion, WorkerContext) {
        let region = CoordinationRegion::create(dir, 1, 1024 * 1024).unwrap();
        let queue = JobQueue::create(&queue_file_name(dir), region.clone(), JobKind::Parse, 1 << 20)
            .unwrap();
        let ctx = WorkerContext::new(
            0,
            queue,
            Some(dir.to_path_buf()),
            Some(BlobStoreConfig::new(dir.join(BLOB_STORE_FILE))),
        );
        (region, ctx)
    }

    fn job_for(path: &Path) -> ParseJob {
        let meta = fs::metadata(path).unwrap();
        ParseJob::new(path.to_path_buf(), StatSnapshot::from_metadata(&meta))
    }

    #[test]
    fn test_text_content_is_truncated() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("notes.TXT"), "hello world, this is long").unwrap();

        let (_region, mut ctx) = context(dir.path());
        let parser = DocumentParser::new(
            &root,
            BasicExtractor {
                content_size: 11,
                thumbnail_max: 0,
            },
        );
        let doc = parser.parse(&job_for(&root.join("notes.TXT")), &mut ctx).unwrap();

        assert_eq!(doc.path, Path::new("notes.TXT"));
        assert_eq!(doc.extension(), "TXT");
        assert_eq!(mime::major(doc.mime), MajorMime::Text);
        assert_eq!(
            doc.meta(MetaKey::Content),
            Some(&MetaValue::Str("hello world".into()))
        );
    }

    #[test]
    fn test_non_utf8_name_points_at_the_file() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        let name = OsStr::from_bytes(b"caf\xe9.txt");
        fs::write(dir.path().join(name), "menu").unwrap();

        let (_region, mut ctx) = context(dir.path());
        let parser = DocumentParser::new(dir.path(), BasicExtractor::default());
        let doc = parser.parse(&job_for(&dir.path().join(name)), &mut ctx).unwrap();

        assert_eq!(doc.path.as_os_str(), name);
        assert!(dir.path().join(&doc.path).exists());
        assert_eq!(doc.meta(MetaKey::Content), Some(&MetaValue::Str("menu".into())));
    }

    #[test]
    fn test_empty_and_unknown_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("empty.txt"), b"").unwrap();
        fs::write(dir.path().join("blob.unknownext"), b"data").unwrap();

        let (_region, mut ctx) = context(dir.path());
        let parser = DocumentParser::new(dir.path(), BasicExtractor::default());

        let empty = parser.parse(&job_for(&dir.path().join("empty.txt")), &mut ctx).unwrap();
        assert_eq!(empty.mime, MIME_EMPTY);
        assert!(empty.meta.is_empty());

        let unknown = parser
            .parse(&job_for(&dir.path().join("blob.unknownext")), &mut ctx)
            .unwrap();
        assert_eq!(unknown.mime, 0);
        assert!(unknown.meta.is_empty());
    }

    #[test]
    fn test_mime_sniffed_without_extension() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("scan0001"), b"%PDF-1.5 rest of file").unwrap();

        let (_region, mut ctx) = context(dir.path());
        let parser = DocumentParser::new(dir.path(), BasicExtractor::default());
        let doc = parser.parse(&job_for(&dir.path().join("scan0001")), &mut ctx).unwrap();
        assert_eq!(Some(doc.mime), mime::mime_by_extension("pdf"));
    }

    #[test]
    fn test_small_image_gets_thumbnail() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pic.png"), b"\x89PNG fake").unwrap();

        let (_region, mut ctx) = context(dir.path());
        let parser = DocumentParser::new(dir.path(), BasicExtractor::default());
        let doc = parser.parse(&job_for(&dir.path().join("pic.png")), &mut ctx).unwrap();
        assert_eq!(doc.meta(MetaKey::Thumbnail), Some(&MetaValue::Int(1)));
        ctx.finish().unwrap();

        let store = BlobStore::open(
            &BlobStoreConfig::new(dir.path().join(BLOB_STORE_FILE)),
            Arc::new(LocalCapacity::new(1 << 20)),
        )
        .unwrap();
        assert_eq!(
            store.read(&doc.id, THUMBNAIL_BLOB).unwrap().as_deref(),
            Some(&b"\x89PNG fake"[..])
        );
    }

    #[test]
    fn test_handle_writes_shard_with_parent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("member.md"), b"# title").unwrap();

        let (_region, mut ctx) = context(dir.path());
        let parser = DocumentParser::new(dir.path(), BasicExtractor::default());
        let parent = DocumentId::random();
        let job = job_for(&dir.path().join("member.md")).with_parent(parent);
        parser.handle(Job::Parse(job), &mut ctx).unwrap();

        let shard = ctx.shard_path().unwrap().to_path_buf();
        ctx.finish().unwrap();
        let docs = read_documents(&shard).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(
            docs[0].meta(MetaKey::Parent),
            Some(&MetaValue::Str(parent.to_string()))
        );
    }

    #[test]
    fn test_result_job_rejected() {
        let dir = tempdir().unwrap();
        let (_region, mut ctx) = context(dir.path());
        let parser = DocumentParser::new(dir.path(), BasicExtractor::default());
        let err = parser
            .handle(Job::Result(ResultJob::delete(DocumentId::random())), &mut ctx)
            .unwrap_err();
        assert!(matches!(err, ScanError::UnexpectedJob { kind: "result" }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_leading_text_drops_cut_character() {
        // "héllo" cut inside the two-byte é
        let bytes = "héllo".as_bytes();
        assert_eq!(leading_text(&bytes[..2]), "h");
        assert_eq!(leading_text(bytes), "héllo");
    }

    #[test]
    fn test_leading_text_replaces_invalid_bytes() {
        let bytes = b"ab\xffcd";
        assert_eq!(leading_text(bytes), "ab\u{fffd}cd");
    }

    #[test]
    fn test_default_extractor_limits() {
        let extractor = BasicExtractor::default();
        assert_eq!(extractor.content_size, 4096);
        assert_eq!(extractor.thumbnail_max, 512 * 1024);
    }
}
