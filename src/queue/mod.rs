//! Durable job queue
//!
//! Jobs are persisted in a SQLite file so that any process in the pool can
//! push or take work, and a crashed worker leaves the remaining jobs intact.

pub mod job;
mod schema;
mod store;

pub use job::{Job, JobKind, ParseJob, ResultJob, ResultOp, StatSnapshot};
pub use store::{queue_file_name, remove_files, JobQueue, PushOutcome, FULL_BACKOFF};
