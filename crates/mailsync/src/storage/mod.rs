//! Storage layer for synced records and attachment bytes
//!
//! - [`RecordStore`]: persistence seam for messages, attachment records and cursors
//! - [`SqliteRecordStore`]: durable store backed by SQLite
//! - [`InMemoryRecordStore`]: volatile store for tests
//! - [`AttachmentStore`]: content-addressed, deduplicating blob store

mod attachments;
mod memory;
mod sqlite;
mod traits;

pub use attachments::{AttachmentStore, BlobStats, sanitize_filename, sanitize_filename_with_limit};
pub use memory::InMemoryRecordStore;
pub use sqlite::SqliteRecordStore;
pub use traits::RecordStore;
