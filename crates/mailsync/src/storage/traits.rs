//! Storage trait definitions

use crate::models::{AttachmentRecord, MessageId, MessageRecord, ScopeKey, SyncCursor};
use anyhow::Result;

/// Trait for record persistence
///
/// Implementations upsert by canonical id and only touch the columns the
/// sync core owns, so data written by downstream enrichment survives
/// re-ingestion.
pub trait RecordStore: Send + Sync {
    /// Insert or update a message record
    ///
    /// The first delivery's `thread_id` and `source_ref` are kept. A record
    /// with the stored `source_ref` replaces the labels; one from any other
    /// source only adds to them.
    fn upsert_message(&self, record: &MessageRecord) -> Result<()>;

    /// Insert or update an attachment record, keyed by
    /// `(message_id, content_hash, filename)`
    fn upsert_attachment(&self, record: &AttachmentRecord) -> Result<()>;

    /// Commit a message and its attachment records as one unit
    fn commit_message(&self, record: &MessageRecord, attachments: &[AttachmentRecord]) -> Result<()>;

    /// Get a message by ID
    fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>>;

    /// Check if a message exists
    fn has_message(&self, id: &MessageId) -> Result<bool>;

    /// Count stored messages
    fn count_messages(&self) -> Result<usize>;

    /// List attachment records for a message
    fn list_attachments(&self, id: &MessageId) -> Result<Vec<AttachmentRecord>>;

    /// Load the cursor for a scope
    fn load_cursor(&self, scope: &ScopeKey) -> Result<Option<SyncCursor>>;

    /// Save a cursor (upsert)
    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    /// Delete the cursor for a scope
    fn delete_cursor(&self, scope: &ScopeKey) -> Result<()>;
}
