//! Message normalization
//!
//! Converts transport payloads into canonical [`MessageRecord`]s plus the
//! attachment parts found while walking the MIME tree. Both transports
//! derive the record id from the `Message-ID` header, so a message maps to
//! one record whichever transport fetched it.

mod gmail;
mod mime;
mod text;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};
use crate::models::{EmailAddress, MessageId, MessageRecord};
use crate::transport::RawPayload;

pub use text::{decode_html_entities, html_to_text, parse_address_list};

/// Body prefix length that feeds the fallback id
const FALLBACK_BODY_PREFIX: usize = 256;

/// A normalized message and its attachment parts
#[derive(Debug, Clone)]
pub struct Normalized {
    pub record: MessageRecord,
    pub attachments: Vec<AttachmentStub>,
    /// When the server received the message, never later than now
    ///
    /// Watermarks are built from this rather than the sender's `Date`
    /// header, since both transports filter on the server's clock.
    pub received_at: DateTime<Utc>,
}

/// Attachment metadata as declared by the message
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentStub {
    /// Declared filename, unsanitized
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub source: AttachmentSource,
}

/// Where the attachment bytes come from
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentSource {
    /// Bytes were delivered with the message
    Inline(Vec<u8>),
    /// Bytes must be fetched separately from the transport
    Remote { attachment_id: String },
}

/// Normalize any transport payload
pub fn normalize(payload: RawPayload) -> SyncResult<Normalized> {
    match payload {
        RawPayload::Api(message) => gmail::normalize_api(message),
        RawPayload::Mime(mime) => mime::normalize_mime(mime),
    }
}

/// Canonical id: the `Message-ID` header, else a content-derived digest
pub(crate) fn derive_id(
    header: Option<&str>,
    date: &DateTime<FixedOffset>,
    from: &[EmailAddress],
    subject: &str,
    body_text: &str,
) -> MessageId {
    if let Some(id) = header.and_then(MessageId::from_header) {
        return id;
    }

    let from = from
        .iter()
        .map(|a| a.email.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",");
    let prefix: String = body_text.trim().chars().take(FALLBACK_BODY_PREFIX).collect();

    let mut hasher = Sha256::new();
    hasher.update(date.with_timezone(&Utc).to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(from.as_bytes());
    hasher.update(b"|");
    hasher.update(subject.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(prefix.as_bytes());
    let digest = hex::encode(hasher.finalize());

    MessageId::new(format!("sha256:{}", &digest[..32]))
}

/// Resolve the message time: `Date` header first, then the transport's date
pub(crate) fn resolve_date(
    id_hint: &str,
    header: Option<&str>,
    internal: Option<DateTime<FixedOffset>>,
) -> SyncResult<DateTime<FixedOffset>> {
    if let Some(date) = header.and_then(parse_date_header) {
        return Ok(date);
    }
    internal.ok_or_else(|| SyncError::parse(id_hint, "message has neither a Date header nor an internal date"))
}

/// Server receive time: the transport's internal date, else the message
/// date, clamped to the present
pub(crate) fn received_at(
    internal: Option<DateTime<FixedOffset>>,
    date: &DateTime<FixedOffset>,
) -> DateTime<Utc> {
    let received = internal.unwrap_or(*date).with_timezone(&Utc);
    received.min(Utc::now())
}

/// Parse an RFC 2822 date, keeping its offset
///
/// Trailing comments such as `(UTC)` are tolerated. Dates chrono rejects
/// fall back to mailparse's lenient parser, pinned to UTC.
pub(crate) fn parse_date_header(value: &str) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date);
    }

    let without_comment = match value.rfind('(') {
        Some(pos) if value.ends_with(')') => value[..pos].trim_end(),
        _ => value,
    };
    if let Ok(date) = DateTime::parse_from_rfc2822(without_comment) {
        return Some(date);
    }

    let timestamp = mailparse::dateparse(value).ok()?;
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|date| date.fixed_offset())
}

/// Content type without parameters, lowercased
pub(crate) fn bare_mime_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc2822("Tue, 5 Mar 2024 09:15:00 +0100").unwrap()
    }

    #[test]
    fn test_header_id_wins() {
        let id = derive_id(Some(" <ABC.123@Mail.Example.com> "), &date(), &[], "s", "b");
        assert_eq!(id.as_str(), "abc.123@mail.example.com");
    }

    #[test]
    fn test_fallback_id_is_stable() {
        let from = vec![EmailAddress::new("Alice@Example.com")];
        let a = derive_id(None, &date(), &from, "Hello", "body text");
        let b = derive_id(Some("  "), &date(), &from, " Hello ", "body text\n");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.as_str().len(), "sha256:".len() + 32);

        let other = derive_id(None, &date(), &from, "Hello again", "body text");
        assert_ne!(a, other);
    }

    #[test]
    fn test_date_header_keeps_offset() {
        let parsed = parse_date_header("Tue, 5 Mar 2024 09:15:00 +0100 (CET)").unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 3600);
        assert_eq!(parsed, date());
    }

    #[test]
    fn test_resolve_date_falls_back_to_internal() {
        let internal = date();
        assert_eq!(resolve_date("m", Some("not a date"), Some(internal)).unwrap(), internal);
        assert!(matches!(
            resolve_date("m", None, None),
            Err(SyncError::Parse { .. })
        ));
    }

    #[test]
    fn test_received_at_prefers_internal_date() {
        let future = DateTime::parse_from_rfc2822("Tue, 5 Mar 2030 09:15:00 +0100").unwrap();
        assert_eq!(received_at(Some(date()), &future), date().with_timezone(&Utc));

        let before = Utc::now();
        let clamped = received_at(None, &future);
        assert!(clamped >= before && clamped <= Utc::now());
    }

    #[test]
    fn test_bare_mime_type() {
        assert_eq!(bare_mime_type("Text/HTML; charset=utf-8"), "text/html");
        assert_eq!(bare_mime_type(""), "");
    }
}
