//! Gmail API response normalization

use chrono::{DateTime, FixedOffset, TimeZone, Utc};

use super::text::{decode_html_entities, html_to_text, parse_address_list};
use super::{
    AttachmentSource, AttachmentStub, Normalized, bare_mime_type, derive_id, received_at, resolve_date,
};
use crate::error::{SyncError, SyncResult};
use crate::models::{MessageRecord, ThreadId};
use crate::transport::gmail::api::{GmailMessage, Header, MessagePart};
use crate::transport::gmail::decode_base64url;

/// Body parts collected while walking the payload
#[derive(Default)]
struct Walk {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<AttachmentStub>,
}

/// Normalize a Gmail API message
pub(super) fn normalize_api(message: GmailMessage) -> SyncResult<Normalized> {
    let payload = message
        .payload
        .as_ref()
        .ok_or_else(|| SyncError::parse(&message.id, "message has no payload"))?;
    let headers = payload.headers.as_deref().unwrap_or_default();

    let internal = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|date| date.fixed_offset());
    let date: DateTime<FixedOffset> = resolve_date(&message.id, header(headers, "Date"), internal)?;

    let from = header(headers, "From").map(parse_address_list).unwrap_or_default();
    let to = header(headers, "To").map(parse_address_list).unwrap_or_default();
    let cc = header(headers, "Cc").map(parse_address_list).unwrap_or_default();
    let bcc = header(headers, "Bcc").map(parse_address_list).unwrap_or_default();
    let subject = header(headers, "Subject").unwrap_or_default().to_string();

    let mut walk = Walk::default();
    walk_part(&message.id, payload, &mut walk)?;

    let body_text = match (&walk.text, &walk.html) {
        (Some(text), _) => text.clone(),
        (None, Some(html)) => html_to_text(html),
        (None, None) => message
            .snippet
            .as_deref()
            .map(decode_html_entities)
            .unwrap_or_default(),
    };

    let id = derive_id(header(headers, "Message-ID"), &date, &from, &subject, &body_text);

    let record = MessageRecord::builder(id, ThreadId::new(&message.thread_id), date)
        .from(from)
        .to(to)
        .cc(cc)
        .bcc(bcc)
        .subject(subject)
        .body_text(body_text)
        .body_html(walk.html)
        .labels(message.label_ids.unwrap_or_default())
        .raw_size(message.size_estimate.unwrap_or(0))
        .source_ref(&message.id)
        .has_attachments(!walk.attachments.is_empty())
        .build();

    Ok(Normalized {
        received_at: received_at(internal, &record.date),
        record,
        attachments: walk.attachments,
    })
}

/// Extract a header value by name
fn header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Recursively classify parts into text body, rich body, and attachments
fn walk_part(id: &str, part: &MessagePart, walk: &mut Walk) -> SyncResult<()> {
    if let Some(parts) = &part.parts
        && !parts.is_empty()
    {
        for child in parts {
            walk_part(id, child, walk)?;
        }
        return Ok(());
    }

    let mime_type = bare_mime_type(part.mime_type.as_deref().unwrap_or_default());
    let headers = part.headers.as_deref().unwrap_or_default();
    let filename = part.filename.as_deref().unwrap_or_default();
    let is_attachment = !filename.is_empty()
        || header(headers, "Content-Disposition")
            .is_some_and(|d| d.trim_start().to_ascii_lowercase().starts_with("attachment"));

    let body = part.body.as_ref();
    if is_attachment {
        let source = match body {
            Some(b) if b.attachment_id.is_some() => AttachmentSource::Remote {
                attachment_id: b.attachment_id.clone().unwrap_or_default(),
            },
            Some(b) => AttachmentSource::Inline(decode_data(id, b.data.as_deref())?),
            None => AttachmentSource::Inline(Vec::new()),
        };
        let size = match &source {
            AttachmentSource::Inline(bytes) => bytes.len() as u64,
            AttachmentSource::Remote { .. } => body.and_then(|b| b.size).unwrap_or(0),
        };
        walk.attachments.push(AttachmentStub {
            filename: filename.to_string(),
            content_type: if mime_type.is_empty() {
                "application/octet-stream".to_string()
            } else {
                mime_type
            },
            size,
            source,
        });
        return Ok(());
    }

    let Some(data) = body.and_then(|b| b.data.as_deref()) else {
        return Ok(());
    };
    match mime_type.as_str() {
        "text/plain" if walk.text.is_none() => {
            walk.text = Some(String::from_utf8_lossy(&decode_data(id, Some(data))?).into_owned());
        }
        "text/html" if walk.html.is_none() => {
            walk.html = Some(String::from_utf8_lossy(&decode_data(id, Some(data))?).into_owned());
        }
        _ => {}
    }
    Ok(())
}

fn decode_data(id: &str, data: Option<&str>) -> SyncResult<Vec<u8>> {
    match data {
        Some(data) => decode_base64url(data)
            .ok_or_else(|| SyncError::parse(id, "body data is not valid base64url")),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::gmail::api::MessageBody;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn headers(pairs: &[(&str, &str)]) -> Option<Vec<Header>> {
        Some(
            pairs
                .iter()
                .map(|(n, v)| Header {
                    name: n.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        )
    }

    fn leaf(mime: &str, filename: &str, data: Option<&[u8]>, attachment_id: Option<&str>) -> MessagePart {
        MessagePart {
            part_id: None,
            mime_type: Some(mime.to_string()),
            filename: Some(filename.to_string()),
            headers: None,
            body: Some(MessageBody {
                size: data.map(|d| d.len() as u64).or(Some(42)),
                data: data.map(|d| URL_SAFE_NO_PAD.encode(d)),
                attachment_id: attachment_id.map(str::to_string),
            }),
            parts: None,
        }
    }

    fn message(payload: Option<MessagePart>) -> GmailMessage {
        GmailMessage {
            id: "18c2a".to_string(),
            thread_id: "18c00".to_string(),
            label_ids: Some(vec!["INBOX".to_string(), "UNREAD".to_string()]),
            snippet: Some("Tom &amp; Jerry".to_string()),
            internal_date: Some("1709626500000".to_string()),
            size_estimate: Some(2048),
            payload,
        }
    }

    fn multipart(header_pairs: &[(&str, &str)], parts: Vec<MessagePart>) -> MessagePart {
        MessagePart {
            part_id: Some(String::new()),
            mime_type: Some("multipart/mixed".to_string()),
            filename: Some(String::new()),
            headers: headers(header_pairs),
            body: Some(MessageBody {
                size: Some(0),
                data: None,
                attachment_id: None,
            }),
            parts: Some(parts),
        }
    }

    #[test]
    fn test_normalize_multipart_with_attachments() {
        let payload = multipart(
            &[
                ("message-id", "<Q3-Report@firm.com>"),
                ("FROM", "Legal <legal@firm.com>"),
                ("To", "a@example.com, b@example.com"),
                ("Subject", "Q3 report"),
                ("Date", "Tue, 5 Mar 2024 09:15:00 +0100"),
            ],
            vec![
                multipart(
                    &[],
                    vec![
                        leaf("text/plain", "", Some(b"Plain body"), None),
                        leaf("text/html", "", Some(b"<p>Rich body</p>"), None),
                    ],
                ),
                leaf("application/pdf", "report.pdf", None, Some("ANGjdJ8")),
                leaf("text/csv", "data.csv", Some(b"a,b\n1,2\n"), None),
            ],
        );

        let normalized = normalize_api(message(Some(payload))).unwrap();
        let record = &normalized.record;

        assert_eq!(record.id.as_str(), "q3-report@firm.com");
        assert_eq!(record.thread_id.as_str(), "18c00");
        assert_eq!(record.from[0].email, "legal@firm.com");
        assert_eq!(record.to.len(), 2);
        assert!(record.cc.is_empty());
        assert_eq!(record.body_text, "Plain body");
        assert_eq!(record.body_html.as_deref(), Some("<p>Rich body</p>"));
        assert_eq!(record.date.offset().local_minus_utc(), 3600);
        assert_eq!(record.source_ref, "18c2a");
        assert_eq!(record.raw_size, 2048);
        assert!(record.labels.contains("UNREAD"));
        assert!(record.has_attachments);
        assert_eq!(normalized.received_at.timestamp_millis(), 1_709_626_500_000);

        assert_eq!(normalized.attachments.len(), 2);
        assert_eq!(
            normalized.attachments[0].source,
            AttachmentSource::Remote {
                attachment_id: "ANGjdJ8".to_string()
            }
        );
        assert_eq!(normalized.attachments[0].size, 42);
        assert_eq!(
            normalized.attachments[1].source,
            AttachmentSource::Inline(b"a,b\n1,2\n".to_vec())
        );
    }

    #[test]
    fn test_html_only_body_is_projected_to_text() {
        let mut payload = leaf("text/html", "", Some(b"<div>Hello <i>there</i></div>"), None);
        payload.headers = headers(&[("Subject", "Hi")]);

        let normalized = normalize_api(message(Some(payload))).unwrap();
        assert!(normalized.record.body_text.contains("Hello"));
        assert!(!normalized.record.body_text.contains("<div>"));
        assert!(normalized.record.body_html.is_some());
        // No Date header: internal date, in UTC
        assert_eq!(normalized.record.timestamp_millis(), 1_709_626_500_000);
        // No Message-ID header: content-derived id
        assert!(normalized.record.id.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_empty_body_uses_snippet() {
        let mut payload = leaf("text/plain", "", None, None);
        payload.headers = headers(&[("Message-ID", "<x@y>")]);

        let normalized = normalize_api(message(Some(payload))).unwrap();
        assert_eq!(normalized.record.body_text, "Tom & Jerry");
        assert_eq!(normalized.record.subject, "");
    }

    #[test]
    fn test_missing_payload_is_parse_error() {
        let err = normalize_api(message(None)).unwrap_err();
        assert!(matches!(err, SyncError::Parse { ref id, .. } if id == "18c2a"));
    }

    #[test]
    fn test_missing_dates_is_parse_error() {
        let mut msg = message(Some(leaf("text/plain", "", Some(b"x"), None)));
        msg.internal_date = None;
        assert!(matches!(normalize_api(msg), Err(SyncError::Parse { .. })));
    }

    #[test]
    fn test_bad_base64_is_parse_error() {
        let mut payload = leaf("text/plain", "", None, None);
        if let Some(body) = payload.body.as_mut() {
            body.data = Some("@@@".to_string());
        }
        assert!(matches!(
            normalize_api(message(Some(payload))),
            Err(SyncError::Parse { .. })
        ));
    }

    #[test]
    fn test_disposition_attachment_without_filename() {
        let mut part = leaf("application/octet-stream", "", Some(b"\x00\x01"), None);
        part.headers = headers(&[("Content-Disposition", "ATTACHMENT")]);
        let normalized = normalize_api(message(Some(multipart(&[], vec![part])))).unwrap();
        assert_eq!(normalized.attachments.len(), 1);
        assert_eq!(normalized.attachments[0].filename, "");
    }
}
