//! In-memory storage implementation
//!
//! Used by tests and by callers that do not need durability.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::RwLock;

use super::RecordStore;
use crate::models::{AttachmentRecord, MessageId, MessageRecord, ScopeKey, SyncCursor};

/// In-memory implementation of RecordStore
///
/// Uses HashMaps protected by RwLocks for thread-safe access.
#[derive(Default)]
pub struct InMemoryRecordStore {
    messages: RwLock<HashMap<MessageId, MessageRecord>>,
    /// Attachment records per message, unique by (content hash, filename)
    attachments: RwLock<HashMap<MessageId, Vec<AttachmentRecord>>>,
    cursors: RwLock<HashMap<ScopeKey, SyncCursor>>,
}

impl InMemoryRecordStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of attachment records across all messages
    pub fn count_attachments(&self) -> usize {
        self.attachments
            .read()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn upsert_message(&self, record: &MessageRecord) -> Result<()> {
        let mut messages = self.messages.write().unwrap();
        let mut stored = record.clone();
        if let Some(first) = messages.get(&record.id)
            && first.source_ref != record.source_ref
        {
            stored.thread_id = first.thread_id.clone();
            stored.source_ref = first.source_ref.clone();
            stored.labels.extend(first.labels.iter().cloned());
        }
        messages.insert(record.id.clone(), stored);
        Ok(())
    }

    fn upsert_attachment(&self, record: &AttachmentRecord) -> Result<()> {
        let mut attachments = self.attachments.write().unwrap();
        let list = attachments.entry(record.message_id.clone()).or_default();
        match list
            .iter_mut()
            .find(|a| a.content_hash == record.content_hash && a.filename == record.filename)
        {
            Some(existing) => *existing = record.clone(),
            None => list.push(record.clone()),
        }
        Ok(())
    }

    fn commit_message(&self, record: &MessageRecord, attachments: &[AttachmentRecord]) -> Result<()> {
        for attachment in attachments {
            self.upsert_attachment(attachment)?;
        }
        self.upsert_message(record)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>> {
        Ok(self.messages.read().unwrap().get(id).cloned())
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        Ok(self.messages.read().unwrap().contains_key(id))
    }

    fn count_messages(&self) -> Result<usize> {
        Ok(self.messages.read().unwrap().len())
    }

    fn list_attachments(&self, id: &MessageId) -> Result<Vec<AttachmentRecord>> {
        Ok(self
            .attachments
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    fn load_cursor(&self, scope: &ScopeKey) -> Result<Option<SyncCursor>> {
        Ok(self.cursors.read().unwrap().get(scope).cloned())
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.cursors
            .write()
            .unwrap()
            .insert(cursor.scope.clone(), cursor.clone());
        Ok(())
    }

    fn delete_cursor(&self, scope: &ScopeKey) -> Result<()> {
        self.cursors.write().unwrap().remove(scope);
        Ok(())
    }
}
