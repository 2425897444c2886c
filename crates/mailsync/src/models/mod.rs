//! Domain models for synced mail entities

mod attachment;
mod cursor;
mod message;

pub use attachment::{AttachmentRecord, ContentHash};
pub use cursor::{CursorState, ResumeMarker, ScopeKey, SyncCursor};
pub use message::{EmailAddress, MessageId, MessageRecord, MessageRecordBuilder, ThreadId};
