//! RFC 5322 document normalization

use mailparse::{DispositionType, MailHeader, MailHeaderMap, ParsedMail};

use super::text::{html_to_text, parse_address_list};
use super::{
    AttachmentSource, AttachmentStub, Normalized, derive_id, received_at, resolve_date,
};
use crate::error::{SyncError, SyncResult};
use crate::models::{MessageId, MessageRecord, ThreadId};
use crate::transport::MimePayload;

#[derive(Default)]
struct Walk {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<AttachmentStub>,
}

/// Normalize raw message bytes fetched over IMAP
pub(super) fn normalize_mime(payload: MimePayload) -> SyncResult<Normalized> {
    let source_ref = payload.source_ref.as_str();
    if payload.bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(SyncError::parse(source_ref, "empty message"));
    }
    if !has_header_separator(&payload.bytes) {
        return Err(SyncError::parse(
            source_ref,
            "truncated message: no header/body separator",
        ));
    }

    let parsed = mailparse::parse_mail(&payload.bytes)
        .map_err(|e| SyncError::parse(source_ref, format!("invalid MIME: {}", e)))?;
    let headers = parsed.headers.as_slice();
    if headers.is_empty() {
        return Err(SyncError::parse(source_ref, "message has no headers"));
    }

    let date = resolve_date(
        source_ref,
        headers.get_first_value("Date").as_deref(),
        payload.internal_date,
    )?;
    let addresses = |name: &str| {
        headers
            .get_first_value(name)
            .map(|v| parse_address_list(&v))
            .unwrap_or_default()
    };
    let from = addresses("From");
    let to = addresses("To");
    let cc = addresses("Cc");
    let bcc = addresses("Bcc");
    let subject = headers.get_first_value("Subject").unwrap_or_default();

    let mut walk = Walk::default();
    walk_part(source_ref, &parsed, &mut walk)?;

    let body_text = match (&walk.text, &walk.html) {
        (Some(text), _) => text.clone(),
        (None, Some(html)) => html_to_text(html),
        (None, None) => String::new(),
    };

    let id = derive_id(
        headers.get_first_value("Message-ID").as_deref(),
        &date,
        &from,
        &subject,
        &body_text,
    );
    let thread_id = thread_root(headers).unwrap_or_else(|| id.clone());

    let record = MessageRecord::builder(id, ThreadId::new(thread_id.as_str()), date)
        .from(from)
        .to(to)
        .cc(cc)
        .bcc(bcc)
        .subject(subject.trim())
        .body_text(body_text)
        .body_html(walk.html)
        .labels(payload.labels)
        .raw_size(payload.size.unwrap_or(payload.bytes.len() as u64))
        .source_ref(source_ref)
        .has_attachments(!walk.attachments.is_empty())
        .build();

    Ok(Normalized {
        received_at: received_at(payload.internal_date, &record.date),
        record,
        attachments: walk.attachments,
    })
}

fn has_header_separator(bytes: &[u8]) -> bool {
    bytes.windows(2).any(|w| w == b"\n\n") || bytes.windows(4).any(|w| w == b"\r\n\r\n")
}

fn walk_part(source_ref: &str, part: &ParsedMail<'_>, walk: &mut Walk) -> SyncResult<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_part(source_ref, sub, walk)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned()
        .unwrap_or_default();
    let mime_type = part.ctype.mimetype.to_ascii_lowercase();
    let decode_error = |e: mailparse::MailParseError| {
        SyncError::parse(source_ref, format!("undecodable {} part: {}", mime_type, e))
    };

    if disposition.disposition == DispositionType::Attachment || !filename.is_empty() {
        let bytes = part.get_body_raw().map_err(decode_error)?;
        walk.attachments.push(AttachmentStub {
            filename,
            content_type: mime_type.clone(),
            size: bytes.len() as u64,
            source: AttachmentSource::Inline(bytes),
        });
        return Ok(());
    }

    match mime_type.as_str() {
        "text/plain" if walk.text.is_none() => {
            walk.text = Some(part.get_body().map_err(decode_error)?);
        }
        "text/html" if walk.html.is_none() => {
            walk.html = Some(part.get_body().map_err(decode_error)?);
        }
        _ => {}
    }
    Ok(())
}

/// Thread root: first `References` entry, else `In-Reply-To`
fn thread_root(headers: &[MailHeader<'_>]) -> Option<MessageId> {
    ["References", "In-Reply-To"].iter().find_map(|name| {
        let value = headers.get_first_value(name)?;
        first_message_id(&value)
    })
}

fn first_message_id(value: &str) -> Option<MessageId> {
    if let Some(start) = value.find('<')
        && let Some(len) = value[start..].find('>')
    {
        return MessageId::from_header(&value[start..=start + len]);
    }
    value.split_whitespace().next().and_then(MessageId::from_header)
}
