//! Multipart batch requests
//!
//! Gmail accepts up to 100 inner requests in one `multipart/mixed` POST to
//! `/batch/gmail/v1`. Each response part wraps a complete HTTP response
//! whose status is classified independently.

use super::api::GmailMessage;
use super::client::{RequestKind, classify_status};
use crate::error::{SyncError, SyncResult};

pub(super) const BOUNDARY: &str = "mailsync_batch_boundary";

/// Maximum inner requests accepted by the batch endpoint
pub(super) const MAX_BATCH: usize = 100;

/// Encode a batch of full-message GETs
pub(super) fn encode_request(user_id: &str, ids: &[&str]) -> String {
    let mut body = String::new();
    for (index, id) in ids.iter().enumerate() {
        body.push_str(&format!("--{}\r\n", BOUNDARY));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str(&format!("Content-ID: <item-{}>\r\n\r\n", index));
        body.push_str(&format!(
            "GET /gmail/v1/users/{}/messages/{}?format=full\r\n\r\n",
            urlencoding::encode(user_id),
            urlencoding::encode(id)
        ));
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));
    body
}

/// Extract the boundary parameter from a `Content-Type` value
pub(super) fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

struct BatchPart {
    index: Option<usize>,
    status: u16,
    body: String,
}

/// Split a batch response into one result per requested message
///
/// Parts are matched by `Content-ID`, falling back to position. Requested
/// items absent from the response are reported as transient failures.
pub(super) fn parse_response(
    body: &str,
    boundary: &str,
    expected: usize,
) -> Vec<SyncResult<GmailMessage>> {
    let delimiter = format!("--{}", boundary);
    let mut slots: Vec<Option<SyncResult<GmailMessage>>> = (0..expected).map(|_| None).collect();
    let mut position = 0;

    for section in body.split(delimiter.as_str()).skip(1) {
        if section.starts_with("--") {
            break;
        }
        let Some(part) = parse_part(section) else {
            continue;
        };
        let index = part.index.unwrap_or(position);
        position += 1;
        if index >= expected || slots[index].is_some() {
            continue;
        }

        let result = if (200..300).contains(&part.status) {
            serde_json::from_str::<GmailMessage>(&part.body)
                .map_err(|e| SyncError::parse(format!("batch item {}", index), e.to_string()))
        } else {
            Err(classify_status(part.status, &part.body, RequestKind::Message, None))
        };
        slots[index] = Some(result);
    }

    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                Err(SyncError::TransientNetwork(
                    "item missing from batch response".to_string(),
                ))
            })
        })
        .collect()
}

fn parse_part(section: &str) -> Option<BatchPart> {
    let section = section.trim_start_matches(['\r', '\n']);
    let (outer_headers, inner) = split_headers(section)?;
    let index = header_value(outer_headers, "content-id").and_then(content_id_index);

    let inner = inner.trim_start_matches(['\r', '\n']);
    let (status_line, after_status) = inner.split_once('\n')?;
    let status = status_line.split_whitespace().nth(1)?.parse::<u16>().ok()?;

    let body = if after_status.starts_with("\r\n") || after_status.starts_with('\n') {
        after_status
    } else {
        split_headers(after_status).map_or(after_status, |(_, body)| body)
    };

    Some(BatchPart {
        index,
        status,
        body: body.trim().to_string(),
    })
}

fn split_headers(text: &str) -> Option<(&str, &str)> {
    if let Some(pos) = text.find("\r\n\r\n") {
        return Some((&text[..pos], &text[pos + 4..]));
    }
    text.find("\n\n").map(|pos| (&text[..pos], &text[pos + 2..]))
}

fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then_some(value.trim())
    })
}

/// `<response-item-3>` -> 3
fn content_id_index(value: &str) -> Option<usize> {
    value
        .trim_start_matches('<')
        .trim_end_matches('>')
        .rsplit('-')
        .next()?
        .parse()
        .ok()
}
