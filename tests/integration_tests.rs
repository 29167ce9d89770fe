//! Integration tests for docscan
//!
//! These tests fork real worker processes. Forking while another test
//! thread is inside SQLite can leave a child deadlocked, so every test here
//! takes `FORK_LOCK` first.

use clap::Parser;
use docscan::error::{ScanError, StoreError, WorkerError};
use docscan::incremental::DELETE_LIST_FILE;
use docscan::index::shard::read_documents;
use docscan::index::{list_shards, Document, DocumentId, MetaKey, MetaValue, CARRIED_SHARD};
use docscan::pool::{JobHandler, PoolConfig, WorkerContext, WorkerPool, EXIT_FATAL};
use docscan::queue::{Job, JobKind, ParseJob, ResultJob, ResultOp, StatSnapshot};
use docscan::store::{BlobStore, BlobStoreConfig, LocalCapacity, BLOB_STORE_FILE};
use docscan::{CliArgs, ScanConfig, Scanner};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tempfile::{tempdir, TempDir};

static FORK_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Writes one document per job with the job's inode, so tests can count
/// deliveries by reading the shards back
struct Recorder;

impl JobHandler for Recorder {
    fn handle(&self, job: Job, ctx: &mut WorkerContext) -> docscan::Result<()> {
        let Job::Parse(job) = job else {
            return Err(ScanError::UnexpectedJob { kind: "result" });
        };
        let doc = document_for(&job)?;
        ctx.write_document(&doc)
    }
}

fn document_for(job: &ParseJob) -> docscan::Result<Document> {
    Ok(Document::new(
        DocumentId::random(),
        job.path.clone(),
        job.stat.inode,
        job.stat.size,
        job.stat.mtime,
        0,
    )?)
}

fn job(name: &str, inode: u64) -> ParseJob {
    ParseJob::new(
        PathBuf::from(format!("/data/{}", name)),
        StatSnapshot {
            inode,
            size: 1,
            mtime: 0,
            mode: 0o100644,
        },
    )
}

struct Harness {
    _dir: TempDir,
    queue_dir: PathBuf,
    out: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let queue_dir = dir.path().join("queue");
        let out = dir.path().join("out");
        fs::create_dir(&queue_dir).unwrap();
        fs::create_dir(&out).unwrap();
        Self {
            _dir: dir,
            queue_dir,
            out,
        }
    }

    fn config(&self, workers: usize) -> PoolConfig {
        PoolConfig::new(workers, JobKind::Parse)
            .with_queue_dir(&self.queue_dir)
            .with_max_queue_bytes(4 * 1024 * 1024)
            .with_shard_dir(&self.out)
    }

    /// Every document across the output shards
    fn documents(&self) -> Vec<Document> {
        list_shards(&self.out)
            .unwrap()
            .iter()
            .flat_map(|shard| read_documents(shard).unwrap())
            .collect()
    }

    fn inode_counts(&self) -> HashMap<u64, usize> {
        let mut counts = HashMap::new();
        for doc in self.documents() {
            *counts.entry(doc.inode).or_insert(0) += 1;
        }
        counts
    }
}

#[test]
fn test_every_job_handled_exactly_once() {
    let _serial = serial();
    let harness = Harness::new();
    let mut pool = WorkerPool::create(harness.config(4), Arc::new(Recorder)).unwrap();
    pool.start().unwrap();

    for i in 0..500 {
        pool.push(job(&format!("f{}.txt", i), i)).unwrap();
    }
    let report = pool.wait().unwrap();

    assert_eq!(report.completed, 500);
    assert!(report.crashes.is_empty());
    assert_eq!(report.snapshot.queued, 0);
    assert_eq!(report.snapshot.busy, 0);

    let counts = harness.inode_counts();
    assert_eq!(counts.len(), 500);
    assert!(counts.values().all(|&n| n == 1), "duplicate delivery");
}

#[test]
fn test_queue_files_removed_after_wait() {
    let _serial = serial();
    let harness = Harness::new();
    let mut pool = WorkerPool::create(harness.config(2), Arc::new(Recorder)).unwrap();
    pool.start().unwrap();
    pool.push(job("a.txt", 1)).unwrap();
    pool.wait().unwrap();

    let leftovers: Vec<_> = fs::read_dir(&harness.queue_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
}

/// Each top-level job fans out into derived jobs pushed from inside the
/// worker; drain must wait for all of them
struct FanOut;

impl JobHandler for FanOut {
    fn handle(&self, job: Job, ctx: &mut WorkerContext) -> docscan::Result<()> {
        let Job::Parse(job) = job else {
            return Ok(());
        };
        let doc = document_for(&job)?;
        if job.parent.is_none() {
            for member in 1..=3 {
                let child = ParseJob::new(
                    job.path.join(format!("member{}", member)),
                    StatSnapshot {
                        inode: 1000 + job.stat.inode * 10 + member,
                        ..job.stat
                    },
                )
                .with_parent(doc.id);
                ctx.push(child)?;
            }
        }
        ctx.write_document(&doc)
    }
}

#[test]
fn test_drain_waits_for_derived_jobs() {
    let _serial = serial();
    let harness = Harness::new();
    let mut pool = WorkerPool::create(harness.config(3), Arc::new(FanOut)).unwrap();
    pool.start().unwrap();

    for i in 1..=50 {
        pool.push(job(&format!("archive{}.zip", i), i)).unwrap();
    }
    let report = pool.wait().unwrap();

    assert_eq!(report.completed, 200);
    let counts = harness.inode_counts();
    assert_eq!(counts.len(), 200);
    for i in 1..=50u64 {
        for member in 1..=3 {
            assert_eq!(counts.get(&(1000 + i * 10 + member)), Some(&1));
        }
    }
}

/// Derives 200 jobs with long paths from each top-level job, far more than
/// a small queue holds
struct WideFanOut;

impl JobHandler for WideFanOut {
    fn handle(&self, job: Job, ctx: &mut WorkerContext) -> docscan::Result<()> {
        let Job::Parse(job) = job else {
            return Ok(());
        };
        let doc = document_for(&job)?;
        if job.parent.is_none() {
            let long = "d".repeat(2000);
            for i in 1..=200 {
                let child = ParseJob::new(
                    job.path.join(&long).join(format!("member{}", i)),
                    StatSnapshot {
                        inode: 1000 + i,
                        ..job.stat
                    },
                )
                .with_parent(doc.id);
                ctx.push(child)?;
            }
        }
        ctx.write_document(&doc)
    }
}

#[test]
fn test_fan_out_past_queue_cap_with_one_worker() {
    let _serial = serial();
    let harness = Harness::new();
    let config = harness.config(1).with_max_queue_bytes(64 * 1024);
    let mut pool = WorkerPool::create(config, Arc::new(WideFanOut)).unwrap();
    pool.start().unwrap();

    pool.push(job("archive.zip", 1)).unwrap();
    let report = pool.wait().unwrap();

    assert_eq!(report.completed, 201);
    assert!(report.crashes.is_empty());
    let counts = harness.inode_counts();
    assert_eq!(counts.len(), 201);
    assert!(counts.values().all(|&n| n == 1), "duplicate delivery");
}

/// Dies on a signal when it sees `crash.bin`
struct Crasher;

impl JobHandler for Crasher {
    fn handle(&self, job: Job, ctx: &mut WorkerContext) -> docscan::Result<()> {
        let Job::Parse(job) = job else {
            return Ok(());
        };
        if job.file_name() == "crash.bin" {
            // The Rust runtime's SIGSEGV handler would swallow a raised signal
            unsafe {
                libc::signal(libc::SIGSEGV, libc::SIG_DFL);
                libc::raise(libc::SIGSEGV);
            }
        }
        ctx.write_document(&document_for(&job)?)
    }
}

#[test]
fn test_crashed_worker_is_replaced() {
    let _serial = serial();
    let harness = Harness::new();
    let mut pool = WorkerPool::create(harness.config(2), Arc::new(Crasher)).unwrap();
    let monitor = pool.monitor();
    pool.start().unwrap();

    for i in 0..100 {
        pool.push(job(&format!("f{}.txt", i), i)).unwrap();
        if i == 40 {
            pool.push(job("crash.bin", 9999)).unwrap();
        }
    }
    let report = pool.wait().unwrap();

    assert_eq!(report.crashes.len(), 1);
    let crash = &report.crashes[0];
    assert_eq!(crash.signal, "SIGSEGV");
    assert_eq!(crash.path.as_deref(), Some("/data/crash.bin"));
    assert_eq!(report.spawned, 3);
    assert_eq!(monitor.progress().crashed, 1);

    // The crashing job is lost, every other job is recorded once
    let counts = harness.inode_counts();
    assert_eq!(counts.len(), 100);
    assert!(!counts.contains_key(&9999));
    assert!(counts.values().all(|&n| n == 1));
}

/// Fails on selected files: `bad.txt` is a per-job error, `fatal.txt`
/// breaks the run
struct Failing;

impl JobHandler for Failing {
    fn handle(&self, job: Job, ctx: &mut WorkerContext) -> docscan::Result<()> {
        let Job::Parse(job) = job else {
            return Ok(());
        };
        if job.file_name() == "bad.txt" {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad").into());
        }
        if job.file_name() == "fatal.txt" {
            return Err(StoreError::ReadOnly.into());
        }
        ctx.write_document(&document_for(&job)?)
    }
}

#[test]
fn test_job_errors_do_not_stop_worker() {
    let _serial = serial();
    let harness = Harness::new();
    let mut pool = WorkerPool::create(harness.config(1), Arc::new(Failing)).unwrap();
    pool.start().unwrap();

    pool.push(job("a.txt", 1)).unwrap();
    pool.push(job("bad.txt", 2)).unwrap();
    pool.push(job("c.txt", 3)).unwrap();
    let report = pool.wait().unwrap();

    assert_eq!(report.completed, 3);
    assert_eq!(report.spawned, 1);
    let counts = harness.inode_counts();
    assert_eq!(counts.keys().copied().collect::<HashSet<_>>(), HashSet::from([1, 3]));
}

#[test]
fn test_fatal_error_fails_the_run() {
    let _serial = serial();
    let harness = Harness::new();
    let mut pool = WorkerPool::create(harness.config(2), Arc::new(Failing)).unwrap();
    pool.start().unwrap();

    pool.push(job("a.txt", 1)).unwrap();
    pool.push(job("fatal.txt", 2)).unwrap();
    let err = pool.wait().unwrap_err();

    assert!(
        matches!(
            err,
            ScanError::Worker(WorkerError::Fatal { code, .. }) if code == EXIT_FATAL
        ),
        "unexpected error: {}",
        err
    );
}

/// Stores a 16 KiB blob per job
struct Thumbnailer;

impl JobHandler for Thumbnailer {
    fn handle(&self, job: Job, ctx: &mut WorkerContext) -> docscan::Result<()> {
        let Job::Parse(job) = job else {
            return Ok(());
        };
        let doc = document_for(&job)?;
        let blob = vec![(job.stat.inode % 251) as u8; 16 * 1024];
        ctx.write_blob(&doc.id, 0, &blob)?;
        ctx.write_document(&doc)
    }
}

#[test]
fn test_blob_store_grows_across_workers() {
    let _serial = serial();
    let harness = Harness::new();
    let initial = 128 * 1024;
    let store_config = BlobStoreConfig {
        path: harness.out.join(BLOB_STORE_FILE),
        initial_capacity: initial,
        growth_chunk: 1024 * 1024,
    };
    let config = harness.config(4).with_blob_store(store_config.clone());
    let mut pool = WorkerPool::create(config, Arc::new(Thumbnailer)).unwrap();
    pool.start().unwrap();

    for i in 0..100 {
        pool.push(job(&format!("img{}.png", i), i)).unwrap();
    }
    let report = pool.wait().unwrap();
    assert_eq!(report.completed, 100);
    assert!(report.snapshot.blob_capacity > initial);

    let store = BlobStore::open(
        &store_config,
        Arc::new(LocalCapacity::new(report.snapshot.blob_capacity)),
    )
    .unwrap();
    assert_eq!(store.len().unwrap(), 100);
    for doc in harness.documents() {
        let blob = store.read(&doc.id, 0).unwrap().unwrap();
        assert_eq!(blob.len(), 16 * 1024);
        assert_eq!(blob[0], (doc.inode % 251) as u8);
    }
}

/// Logs every result job as `+<id> <payload>` or `-<id>`
struct ResultLog {
    path: PathBuf,
}

impl JobHandler for ResultLog {
    fn handle(&self, job: Job, _ctx: &mut WorkerContext) -> docscan::Result<()> {
        let Job::Result(job) = job else {
            return Err(ScanError::UnexpectedJob { kind: "parse" });
        };
        let line = match job.op {
            ResultOp::Insert => format!("+{} {}\n", job.doc_id, job.payload.unwrap_or_default()),
            ResultOp::Delete => format!("-{}\n", job.doc_id),
        };
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[test]
fn test_result_pool_handles_inserts_and_deletes() {
    let _serial = serial();
    let harness = Harness::new();
    let log = harness.out.join("results.log");
    let config = PoolConfig::new(2, JobKind::Result)
        .with_queue_dir(&harness.queue_dir)
        .with_max_queue_bytes(4 * 1024 * 1024);
    let mut pool = WorkerPool::create(config, Arc::new(ResultLog { path: log.clone() })).unwrap();
    pool.start().unwrap();

    let mut expected = HashSet::new();
    for i in 0..50 {
        let id = DocumentId::random();
        let payload = format!("{{\"n\":{}}}", i);
        expected.insert(format!("+{} {}", id, payload));
        pool.push(ResultJob::insert(id, payload)).unwrap();

        let id = DocumentId::random();
        expected.insert(format!("-{}", id));
        pool.push(ResultJob::delete(id)).unwrap();
    }
    // A parse job does not belong on a result queue
    assert!(pool.push(job("a.txt", 1)).is_err());

    let report = pool.wait().unwrap();
    assert_eq!(report.completed, 100);

    let logged = fs::read_to_string(&log).unwrap();
    let lines: HashSet<String> = logged.lines().map(str::to_string).collect();
    assert_eq!(logged.lines().count(), 100);
    assert_eq!(lines, expected);
}

/// Reports its pid, then blocks until killed
struct Sleeper {
    pid_file: PathBuf,
}

impl JobHandler for Sleeper {
    fn handle(&self, _job: Job, _ctx: &mut WorkerContext) -> docscan::Result<()> {
        let tmp = self.pid_file.with_extension("tmp");
        fs::write(&tmp, std::process::id().to_string())?;
        fs::rename(&tmp, &self.pid_file)?;
        thread::sleep(Duration::from_secs(60));
        Ok(())
    }
}

/// Whether `pid` has exited (reaped, or a zombie)
fn is_gone(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        // The state field follows the parenthesized command name
        Ok(stat) => stat
            .rsplit_once(')')
            .map_or(false, |(_, rest)| rest.trim_start().starts_with('Z')),
    }
}

#[test]
fn test_workers_die_with_their_parent() {
    let _serial = serial();
    let harness = Harness::new();
    let pid_file = harness.out.join("worker.pid");

    // A separate process owns the pool so it can be killed outright
    let owner = match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let ran = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let handler = Arc::new(Sleeper {
                    pid_file: pid_file.clone(),
                });
                let mut pool = WorkerPool::create(harness.config(1), handler).unwrap();
                pool.start().unwrap();
                pool.push(job("slow.txt", 1)).unwrap();
                thread::sleep(Duration::from_secs(60));
            }));
            unsafe { libc::_exit(if ran.is_ok() { 0 } else { 1 }) }
        }
        ForkResult::Parent { child } => child,
    };

    let deadline = Instant::now() + Duration::from_secs(20);
    let worker = loop {
        if let Ok(pid) = fs::read_to_string(&pid_file) {
            break pid.trim().parse::<i32>().unwrap();
        }
        assert!(Instant::now() < deadline, "worker never started");
        thread::sleep(Duration::from_millis(20));
    };

    kill(owner, Signal::SIGKILL).unwrap();
    waitpid(owner, None).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !is_gone(worker) {
        assert!(Instant::now() < deadline, "worker {} outlived its parent", worker);
        thread::sleep(Duration::from_millis(20));
    }
}

/// Small tree for end-to-end scans
fn source_tree(root: &Path) {
    fs::create_dir_all(root.join("docs/nested")).unwrap();
    fs::create_dir_all(root.join("pics")).unwrap();
    fs::write(root.join("readme.txt"), "top level readme").unwrap();
    fs::write(root.join("docs/guide.md"), "# Guide\n\nSome text.").unwrap();
    fs::write(root.join("docs/nested/data.csv"), "a,b\n1,2\n").unwrap();
    fs::write(root.join("docs/empty.txt"), "").unwrap();
    fs::write(root.join("pics/logo.png"), b"\x89PNG\r\n\x1a\nfake").unwrap();
    fs::write(root.join("archive.bin"), [0u8; 64]).unwrap();
}

fn scan_config(root: &Path, out: &Path, queue_dir: &Path, extra: &[&str]) -> ScanConfig {
    let mut argv = vec![
        "docscan".to_string(),
        root.display().to_string(),
        "-o".to_string(),
        out.display().to_string(),
        "-t".to_string(),
        "3".to_string(),
        "--queue-dir".to_string(),
        queue_dir.display().to_string(),
        "-q".to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    ScanConfig::from_args(CliArgs::try_parse_from(argv).unwrap()).unwrap()
}

fn by_path(out: &Path) -> HashMap<String, Document> {
    list_shards(out)
        .unwrap()
        .iter()
        .flat_map(|shard| read_documents(shard).unwrap())
        .map(|doc| (doc.path.to_string_lossy().into_owned(), doc))
        .collect()
}

#[test]
fn test_scan_end_to_end() {
    let _serial = serial();
    let dir = tempdir().unwrap();
    let root = dir.path().join("src");
    let out = dir.path().join("idx");
    source_tree(&root);

    let scanner = Scanner::new(scan_config(&root, &out, dir.path(), &[]));
    let result = scanner.run().unwrap();

    assert_eq!(result.walk.files, 6);
    assert_eq!(result.pool.completed, 6);
    assert!(result.copied.is_none());

    let docs = by_path(&out);
    assert_eq!(docs.len(), 6);
    assert_eq!(
        docs["readme.txt"].meta(MetaKey::Content),
        Some(&MetaValue::Str("top level readme".into()))
    );
    assert_eq!(docs["docs/empty.txt"].mime, docscan::scan::mime::MIME_EMPTY);
    assert_eq!(docs["pics/logo.png"].meta(MetaKey::Thumbnail), Some(&MetaValue::Int(1)));
    assert!(docs["archive.bin"].meta.is_empty());

    let store = BlobStore::open_readonly(&out.join(BLOB_STORE_FILE)).unwrap();
    assert_eq!(
        store.read(&docs["pics/logo.png"].id, 0).unwrap().as_deref(),
        Some(&b"\x89PNG\r\n\x1a\nfake"[..])
    );
}

#[test]
fn test_incremental_scan() {
    let _serial = serial();
    let dir = tempdir().unwrap();
    let root = dir.path().join("src");
    let first = dir.path().join("idx1");
    let second = dir.path().join("idx2");
    let third = dir.path().join("idx3");
    source_tree(&root);

    Scanner::new(scan_config(&root, &first, dir.path(), &[]))
        .run()
        .unwrap();
    let baseline = by_path(&first);

    // Nothing changed: everything is copied, nothing parsed
    let result = Scanner::new(scan_config(
        &root,
        &second,
        dir.path(),
        &["--incremental", first.to_str().unwrap()],
    ))
    .run()
    .unwrap();
    assert_eq!(result.skipped, 6);
    assert_eq!(result.pool.completed, 0);
    let copied = result.copied.unwrap();
    assert_eq!(copied.copied, 6);
    assert_eq!(copied.deleted, 0);
    assert!(second.join(CARRIED_SHARD).is_file());
    assert_eq!(by_path(&second), baseline);
    assert_eq!(fs::read_to_string(second.join(DELETE_LIST_FILE)).unwrap(), "");

    let store = BlobStore::open_readonly(&second.join(BLOB_STORE_FILE)).unwrap();
    assert!(store.read(&baseline["pics/logo.png"].id, 0).unwrap().is_some());

    // One file modified, one removed
    let guide = root.join("docs/guide.md");
    fs::write(&guide, "# Guide\n\nRewritten.").unwrap();
    fs::File::options()
        .write(true)
        .open(&guide)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
    fs::remove_file(root.join("archive.bin")).unwrap();

    let result = Scanner::new(scan_config(
        &root,
        &third,
        dir.path(),
        &["--incremental", second.to_str().unwrap()],
    ))
    .run()
    .unwrap();
    assert_eq!(result.skipped, 4);
    assert_eq!(result.pool.completed, 1);
    let copied = result.copied.unwrap();
    assert_eq!(copied.copied, 4);
    assert_eq!(copied.deleted, 1);

    let docs = by_path(&third);
    assert_eq!(docs.len(), 5);
    assert_ne!(docs["docs/guide.md"].id, baseline["docs/guide.md"].id);
    assert_eq!(docs["readme.txt"], baseline["readme.txt"]);
    assert_eq!(
        fs::read_to_string(third.join(DELETE_LIST_FILE)).unwrap(),
        format!("{}\n", baseline["archive.bin"].id)
    );
}

#[test]
fn test_scan_never_reuses_an_index() {
    let _serial = serial();
    let dir = tempdir().unwrap();
    let root = dir.path().join("src");
    let out = dir.path().join("idx");
    source_tree(&root);

    let config = scan_config(&root, &out, dir.path(), &[]);
    Scanner::new(config.clone()).run().unwrap();

    // Validation refuses the existing directory
    let argv = [
        "docscan",
        root.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
        "--queue-dir",
        dir.path().to_str().unwrap(),
    ];
    assert!(ScanConfig::from_args(CliArgs::try_parse_from(argv).unwrap()).is_err());

    // A config validated before the first run still cannot write into it
    let err = Scanner::new(config).run().unwrap_err();
    assert!(matches!(err, ScanError::Io(_)), "unexpected error: {}", err);
    assert_eq!(by_path(&out).len(), 6);
}

#[test]
fn test_scan_keeps_non_utf8_names() {
    let _serial = serial();
    let dir = tempdir().unwrap();
    let root = dir.path().join("src");
    let out = dir.path().join("idx");
    source_tree(&root);
    let name = OsStr::from_bytes(b"docs/caf\xe9.txt");
    fs::write(root.join(name), "menu").unwrap();

    Scanner::new(scan_config(&root, &out, dir.path(), &[]))
        .run()
        .unwrap();

    let docs: Vec<Document> = by_path(&out).into_values().collect();
    assert_eq!(docs.len(), 7);
    let doc = docs
        .iter()
        .find(|doc| doc.path.as_os_str() == name)
        .expect("record for non-UTF-8 name");
    assert!(root.join(&doc.path).is_file());
    assert_eq!(doc.meta(MetaKey::Content), Some(&MetaValue::Str("menu".into())));
}
