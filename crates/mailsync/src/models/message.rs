//! Canonical message record produced by the normalizer

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique, transport-independent identifier for a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the canonical id from an RFC 5322 `Message-ID` header value
    ///
    /// Angle brackets and surrounding whitespace are stripped and the value
    /// is lowercased, so `<ABC@host>` and `abc@host` name the same message.
    /// Returns None for blank values.
    pub fn from_header(value: &str) -> Option<Self> {
        let trimmed = value
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_ascii_lowercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the conversation a message belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Canonical, transport-independent message record
///
/// Fields are owned by the sync core. Enrichment results are stored by the
/// persistence layer alongside the record and are never overwritten by an
/// upsert of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub from: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    /// Plain-text projection used for search indexing
    pub body_text: String,
    /// Rich (formatted) body, kept for storage fidelity
    pub body_html: Option<String>,
    /// Sent/received time, always with its original UTC offset
    pub date: DateTime<FixedOffset>,
    pub labels: BTreeSet<String>,
    pub raw_size: u64,
    /// Transport-specific locator (e.g. a Gmail id or `imap:INBOX:42`)
    pub source_ref: String,
    pub has_attachments: bool,
}

impl MessageRecord {
    /// Create a new record builder
    pub fn builder(id: MessageId, thread_id: ThreadId, date: DateTime<FixedOffset>) -> MessageRecordBuilder {
        MessageRecordBuilder::new(id, thread_id, date)
    }

    /// Timestamp in milliseconds since the epoch
    pub fn timestamp_millis(&self) -> i64 {
        self.date.timestamp_millis()
    }
}

/// Builder for creating MessageRecord instances
pub struct MessageRecordBuilder {
    record: MessageRecord,
}

impl MessageRecordBuilder {
    fn new(id: MessageId, thread_id: ThreadId, date: DateTime<FixedOffset>) -> Self {
        Self {
            record: MessageRecord {
                id,
                thread_id,
                from: Vec::new(),
                to: Vec::new(),
                cc: Vec::new(),
                bcc: Vec::new(),
                subject: String::new(),
                body_text: String::new(),
                body_html: None,
                date,
                labels: BTreeSet::new(),
                raw_size: 0,
                source_ref: String::new(),
                has_attachments: false,
            },
        }
    }

    pub fn from(mut self, from: Vec<EmailAddress>) -> Self {
        self.record.from = from;
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.record.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<EmailAddress>) -> Self {
        self.record.cc = cc;
        self
    }

    pub fn bcc(mut self, bcc: Vec<EmailAddress>) -> Self {
        self.record.bcc = bcc;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.record.subject = subject.into();
        self
    }

    pub fn body_text(mut self, body_text: impl Into<String>) -> Self {
        self.record.body_text = body_text.into();
        self
    }

    pub fn body_html(mut self, body_html: Option<String>) -> Self {
        self.record.body_html = body_html;
        self
    }

    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn raw_size(mut self, raw_size: u64) -> Self {
        self.record.raw_size = raw_size;
        self
    }

    pub fn source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.record.source_ref = source_ref.into();
        self
    }

    pub fn has_attachments(mut self, has_attachments: bool) -> Self {
        self.record.has_attachments = has_attachments;
        self
    }

    pub fn build(self) -> MessageRecord {
        self.record
    }
}
