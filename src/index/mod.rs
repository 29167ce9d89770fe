//! Index output: document records, shards and the index descriptor
//!
//! - `document`: document records and typed meta lines
//! - `shard`: per-process append-only shard files
//! - `descriptor`: `descriptor.json` for an index directory

pub mod descriptor;
pub mod document;
pub mod shard;

pub use descriptor::{IndexDescriptor, DESCRIPTOR_FILE, INDEX_VERSION};
pub use document::{Document, DocumentId, MetaKey, MetaKind, MetaLine, MetaValue};
pub use shard::{list_shards, shard_path, RawRecord, ShardReader, ShardWriter, CARRIED_SHARD};
