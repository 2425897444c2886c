//! Mail extraction and incremental synchronization core
//!
//! This crate pulls messages from a remote mail store and keeps a local
//! copy current:
//! - Transports for the Gmail API and IMAP behind one capability-queried trait
//! - A normalizer producing transport-independent message records
//! - A deduplicating, content-addressed attachment store
//! - SQLite persistence for records and resumable sync cursors
//! - A pipeline with retry, circuit breaking and transport switching
//!
//! Credential acquisition, query parsing and downstream enrichment live
//! outside this crate and plug in through [`CredentialSource`] and the
//! enrichment channel.

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod service;
pub mod storage;
pub mod sync;
pub mod transport;

pub use auth::{AuthHandle, Credential, CredentialKind, CredentialSource, StaticCredential};
pub use crate::config::SyncConfig;
pub use error::{ErrorClass, SyncError, SyncResult};
pub use models::{
    AttachmentRecord, ContentHash, CursorState, EmailAddress, MessageId, MessageRecord,
    ResumeMarker, ScopeKey, SyncCursor, ThreadId,
};
pub use normalize::{AttachmentSource, AttachmentStub, Normalized, normalize};
pub use service::{SyncScope, SyncService};
pub use storage::{
    AttachmentStore, BlobStats, InMemoryRecordStore, RecordStore, SqliteRecordStore,
    sanitize_filename,
};
pub use sync::{
    CancelToken, CommittedMessage, ItemOutcome, Notifier, Pipeline, ProgressEvent, RunEvent,
    RunOutcome, RunStats, RunStatus, SyncMode, TransportSlot,
};
pub use transport::{
    CandidatePage, CandidateQuery, Capabilities, GmailTransport, ImapTransport, MimePayload,
    RawHandle, RawPayload, Since, Transport,
};
