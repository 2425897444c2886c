//! Transport abstraction over the remote mail store
//!
//! Two transports implement [`Transport`]:
//! - [`GmailTransport`]: authenticated, paginated HTTP API with history tokens
//! - [`ImapTransport`]: stateful protocol connection with explicit searches
//!
//! Callers query [`Transport::capabilities`] and branch on the declared
//! flags; they never inspect the concrete transport type.

pub mod gmail;
pub mod imap;

use chrono::{DateTime, FixedOffset, Utc};

use crate::auth::AuthHandle;
use crate::error::{SyncError, SyncResult};

pub use gmail::GmailTransport;
pub use imap::{ImapConnector, ImapSession, ImapTransport, NativeTlsConnector};

/// What a transport can do
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    /// Server-side incremental position tokens
    pub supports_history_cursor: bool,
    /// Several messages per request
    pub supports_batch_fetch: bool,
    /// Labels/flags can be changed remotely
    pub supports_label_mutation: bool,
    /// Candidate pages are returned oldest first
    pub oldest_first: bool,
    /// Suggested request rate (requests per second)
    pub rate_limit_hint: Option<f64>,
}

/// Lower bound for a candidate search
#[derive(Debug, Clone, PartialEq)]
pub enum Since {
    /// No lower bound: full historical extraction
    Beginning,
    /// Resume from a stored position
    Position {
        token: Option<String>,
        watermark: Option<DateTime<Utc>>,
    },
}

/// Parameters for one page of candidates
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    /// Opaque filter expression, passed through to the transport
    pub filter: String,
    pub since: Since,
    pub page_size: usize,
    pub page_token: Option<String>,
}

/// Transport-specific reference to a remote message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawHandle {
    pub id: String,
    pub thread_hint: Option<String>,
}

impl RawHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_hint: None,
        }
    }
}

/// One page of candidate messages
#[derive(Debug, Clone, Default)]
pub struct CandidatePage {
    pub handles: Vec<RawHandle>,
    pub next_page_token: Option<String>,
    /// Server position reported alongside this page, if any
    pub position: Option<String>,
}

/// A complete message as delivered by a transport
#[derive(Debug)]
pub enum RawPayload {
    /// Structured API object
    Api(gmail::api::GmailMessage),
    /// Multi-part encoded RFC 5322 document
    Mime(MimePayload),
}

/// Raw RFC 5322 bytes plus transport metadata
#[derive(Debug, Clone)]
pub struct MimePayload {
    pub bytes: Vec<u8>,
    pub source_ref: String,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub labels: Vec<String>,
    pub size: Option<u64>,
}

/// Uniform fetch/search interface over the remote mail store
pub trait Transport: Send + Sync {
    /// Short name used in logs, events, and resume markers
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// List candidate messages after `query.since`
    fn fetch_candidates(&self, auth: &AuthHandle, query: &CandidateQuery) -> SyncResult<CandidatePage>;

    /// Fetch one complete message
    fn fetch_full(&self, auth: &AuthHandle, handle: &RawHandle) -> SyncResult<RawPayload>;

    /// Fetch several messages, returning one result per handle in order
    ///
    /// An outer error means the whole request failed.
    fn fetch_batch(
        &self,
        auth: &AuthHandle,
        handles: &[RawHandle],
    ) -> SyncResult<Vec<SyncResult<RawPayload>>> {
        Ok(handles
            .iter()
            .map(|handle| self.fetch_full(auth, handle))
            .collect())
    }

    /// Fetch attachment bytes that were not delivered inline
    fn fetch_attachment(
        &self,
        _auth: &AuthHandle,
        _handle: &RawHandle,
        _attachment_id: &str,
    ) -> SyncResult<Vec<u8>> {
        Err(SyncError::Unsupported {
            transport: self.name(),
            operation: "fetch_attachment",
        })
    }

    /// Current server position, captured before a full extraction
    fn current_position(&self, _auth: &AuthHandle) -> SyncResult<Option<String>> {
        Ok(None)
    }

    /// Resolve a record's `source_ref` into a handle, if it belongs here
    fn handle_for(&self, source_ref: &str) -> Option<RawHandle>;

    /// Add and remove labels on a remote message
    fn modify_labels(
        &self,
        _auth: &AuthHandle,
        _handle: &RawHandle,
        _add: &[String],
        _remove: &[String],
    ) -> SyncResult<()> {
        Err(SyncError::Unsupported {
            transport: self.name(),
            operation: "modify_labels",
        })
    }
}
