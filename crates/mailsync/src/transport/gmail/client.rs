//! Gmail API HTTP client
//!
//! Provides methods for fetching messages from the Gmail API.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::time::Duration;

use super::api::{
    AttachmentBody, ErrorResponse, GmailMessage, HistoryResponse, ListMessagesResponse,
    ModifyRequest, Profile,
};
use super::batch;
use crate::auth::AuthHandle;
use crate::config::GmailConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{
    CandidatePage, CandidateQuery, Capabilities, RawHandle, RawPayload, Since, Transport,
};

/// Maximum page size accepted by the list and history endpoints
const MAX_PAGE_SIZE: usize = 500;

/// Which endpoint a response came from; affects status classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RequestKind {
    List,
    History,
    Message,
    Attachment,
    Profile,
    Modify,
    Batch,
}

/// Gmail API transport
pub struct GmailTransport {
    agent: ureq::Agent,
    base_url: String,
    user_id: String,
    batch_size: usize,
}

impl GmailTransport {
    pub fn new(config: &GmailConfig, timeout: Duration, batch_size: usize) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: config.user_id.clone(),
            batch_size: batch_size.clamp(1, batch::MAX_BATCH),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/gmail/v1/users/{}/{}",
            self.base_url,
            urlencoding::encode(&self.user_id),
            path
        )
    }

    fn bearer(&self, auth: &AuthHandle) -> SyncResult<String> {
        let credential = auth.get_valid_handle()?;
        Ok(format!("Bearer {}", credential.secret))
    }

    /// GET a JSON resource, classifying non-2xx responses
    fn get_json<T: DeserializeOwned>(
        &self,
        auth: &AuthHandle,
        url: &str,
        kind: RequestKind,
    ) -> SyncResult<T> {
        let mut response = self
            .agent
            .get(url)
            .header("Authorization", &self.bearer(auth)?)
            .call()
            .map_err(map_transport_error)?;

        check_status(&mut response, kind)?;

        response.body_mut().read_json::<T>().map_err(|e| match kind {
            RequestKind::Message => SyncError::parse(url, e.to_string()),
            _ => SyncError::TransientNetwork(format!("Failed to read {:?} response: {}", kind, e)),
        })
    }

    /// One page of `messages.list`
    fn list_page(
        &self,
        auth: &AuthHandle,
        q: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> SyncResult<CandidatePage> {
        let mut url = format!(
            "{}?maxResults={}",
            self.api_url("messages"),
            page_size.clamp(1, MAX_PAGE_SIZE)
        );
        if !q.trim().is_empty() {
            url.push_str(&format!("&q={}", urlencoding::encode(q)));
        }
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let list: ListMessagesResponse = self.get_json(auth, &url, RequestKind::List)?;
        let handles = list
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|m| RawHandle {
                id: m.id,
                thread_hint: m.thread_id,
            })
            .collect();

        Ok(CandidatePage {
            handles,
            next_page_token: list.next_page_token,
            position: None,
        })
    }

    /// One page of `history.list`, reduced to added messages
    ///
    /// A 404 means the start position is too old and surfaces as
    /// [`SyncError::CursorInvalid`].
    fn history_page(
        &self,
        auth: &AuthHandle,
        start_history_id: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> SyncResult<CandidatePage> {
        let mut url = format!(
            "{}?startHistoryId={}&historyTypes=messageAdded&maxResults={}",
            self.api_url("history"),
            urlencoding::encode(start_history_id),
            page_size.clamp(1, MAX_PAGE_SIZE)
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let history: HistoryResponse = self.get_json(auth, &url, RequestKind::History)?;

        let mut seen = HashSet::new();
        let handles = history
            .history
            .unwrap_or_default()
            .into_iter()
            .flat_map(|record| record.messages_added.unwrap_or_default())
            .filter(|added| seen.insert(added.message.id.clone()))
            .map(|added| RawHandle {
                id: added.message.id,
                thread_hint: added.message.thread_id,
            })
            .collect();

        Ok(CandidatePage {
            handles,
            next_page_token: history.next_page_token,
            position: history.history_id,
        })
    }

    fn batch_get(
        &self,
        auth: &AuthHandle,
        handles: &[RawHandle],
    ) -> SyncResult<Vec<SyncResult<RawPayload>>> {
        let ids: Vec<&str> = handles.iter().map(|h| h.id.as_str()).collect();
        let body = batch::encode_request(&self.user_id, &ids);

        let mut response = self
            .agent
            .post(&format!("{}/batch/gmail/v1", self.base_url))
            .header("Authorization", &self.bearer(auth)?)
            .header(
                "Content-Type",
                &format!("multipart/mixed; boundary={}", batch::BOUNDARY),
            )
            .send(body.as_bytes())
            .map_err(map_transport_error)?;

        check_status(&mut response, RequestKind::Batch)?;

        let boundary = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .and_then(batch::boundary_from_content_type)
            .ok_or_else(|| {
                SyncError::TransientNetwork("batch response has no multipart boundary".to_string())
            })?;
        let text = response.body_mut().read_to_string().map_err(|e| {
            SyncError::TransientNetwork(format!("Failed to read batch response: {}", e))
        })?;

        Ok(batch::parse_response(&text, &boundary, handles.len())
            .into_iter()
            .map(|item| item.map(RawPayload::Api))
            .collect())
    }
}

impl Transport for GmailTransport {
    fn name(&self) -> &'static str {
        "gmail"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_history_cursor: true,
            supports_batch_fetch: true,
            supports_label_mutation: true,
            oldest_first: false,
            // 250 quota units/s per user, 5 units per messages.get
            rate_limit_hint: Some(40.0),
        }
    }

    fn fetch_candidates(&self, auth: &AuthHandle, query: &CandidateQuery) -> SyncResult<CandidatePage> {
        let page_token = query.page_token.as_deref();
        match &query.since {
            Since::Position {
                token: Some(token), ..
            } if query.filter.trim().is_empty() => {
                self.history_page(auth, token, query.page_size, page_token)
            }
            Since::Position { watermark, .. } => {
                let q = compose_query(&query.filter, *watermark);
                self.list_page(auth, &q, query.page_size, page_token)
            }
            Since::Beginning => self.list_page(auth, &query.filter, query.page_size, page_token),
        }
    }

    fn fetch_full(&self, auth: &AuthHandle, handle: &RawHandle) -> SyncResult<RawPayload> {
        let url = format!(
            "{}?format=full",
            self.api_url(&format!("messages/{}", urlencoding::encode(&handle.id)))
        );
        let message: GmailMessage = self.get_json(auth, &url, RequestKind::Message)?;
        Ok(RawPayload::Api(message))
    }

    fn fetch_batch(
        &self,
        auth: &AuthHandle,
        handles: &[RawHandle],
    ) -> SyncResult<Vec<SyncResult<RawPayload>>> {
        let mut results = Vec::with_capacity(handles.len());
        for chunk in handles.chunks(self.batch_size) {
            debug!("[GMAIL] Batch fetching {} messages", chunk.len());
            results.extend(self.batch_get(auth, chunk)?);
        }
        Ok(results)
    }

    fn fetch_attachment(
        &self,
        auth: &AuthHandle,
        handle: &RawHandle,
        attachment_id: &str,
    ) -> SyncResult<Vec<u8>> {
        let url = self.api_url(&format!(
            "messages/{}/attachments/{}",
            urlencoding::encode(&handle.id),
            urlencoding::encode(attachment_id)
        ));
        let attachment: AttachmentBody = self.get_json(auth, &url, RequestKind::Attachment)?;
        let data = attachment.data.unwrap_or_default();
        decode_base64url(&data)
            .ok_or_else(|| SyncError::parse(&handle.id, "attachment data is not valid base64url"))
    }

    fn current_position(&self, auth: &AuthHandle) -> SyncResult<Option<String>> {
        let profile: Profile = self.get_json(auth, &self.api_url("profile"), RequestKind::Profile)?;
        Ok(profile.history_id)
    }

    fn handle_for(&self, source_ref: &str) -> Option<RawHandle> {
        if source_ref.is_empty() || source_ref.contains(':') {
            None
        } else {
            Some(RawHandle::new(source_ref))
        }
    }

    fn modify_labels(
        &self,
        auth: &AuthHandle,
        handle: &RawHandle,
        add: &[String],
        remove: &[String],
    ) -> SyncResult<()> {
        let url = self.api_url(&format!("messages/{}/modify", urlencoding::encode(&handle.id)));
        let request = ModifyRequest {
            add_label_ids: add,
            remove_label_ids: remove,
        };

        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &self.bearer(auth)?)
            .send_json(&request)
            .map_err(map_transport_error)?;

        check_status(&mut response, RequestKind::Modify)
    }
}

/// Combine a caller filter with a watermark lower bound
///
/// `after:` has one-second resolution; the bound is moved back one second so
/// messages sharing the watermark's second are re-delivered rather than lost.
pub(crate) fn compose_query(filter: &str, watermark: Option<DateTime<Utc>>) -> String {
    let filter = filter.trim();
    match watermark {
        Some(watermark) => {
            let bound = format!("after:{}", watermark.timestamp() - 1);
            if filter.is_empty() {
                bound
            } else {
                format!("{} {}", filter, bound)
            }
        }
        None => filter.to_string(),
    }
}

/// Decode Gmail's base64url payloads, with or without padding
pub(crate) fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim().trim_end_matches('=');
    let padding = (4 - trimmed.len() % 4) % 4;
    let mut padded = String::with_capacity(trimmed.len() + padding);
    padded.push_str(trimmed);
    padded.extend(std::iter::repeat_n('=', padding));
    URL_SAFE.decode(padded.as_bytes()).ok()
}

/// Turn a non-2xx response into the matching error
fn check_status(response: &mut ureq::http::Response<ureq::Body>, kind: RequestKind) -> SyncResult<()> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(());
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.body_mut().read_to_string().unwrap_or_default();

    let err = classify_status(status, &body, kind, retry_after);
    warn!("[GMAIL] {:?} request failed with {}: {}", kind, status, err);
    Err(err)
}

/// Classify an HTTP status plus error envelope
pub(super) fn classify_status(
    status: u16,
    body: &str,
    kind: RequestKind,
    retry_after: Option<Duration>,
) -> SyncError {
    let envelope = serde_json::from_str::<ErrorResponse>(body).ok();
    let message = envelope
        .as_ref()
        .and_then(|e| e.error.message.clone())
        .unwrap_or_else(|| format!("HTTP {}", status));
    let reason = envelope
        .as_ref()
        .and_then(|e| e.error.errors.as_ref())
        .and_then(|errors| errors.iter().find_map(|d| d.reason.clone()));

    match (status, reason.as_deref()) {
        (401, _) => SyncError::AuthExpired(message),
        (404, _) if kind == RequestKind::History => SyncError::CursorInvalid,
        (403 | 429, Some("dailyLimitExceeded" | "quotaExceeded")) => SyncError::QuotaExceeded(message),
        (403 | 429, Some("rateLimitExceeded" | "userRateLimitExceeded")) | (429, _) => {
            SyncError::RateLimited { retry_after }
        }
        (403, _) => SyncError::AuthExpired(message),
        (500..=599, _) => SyncError::TransientNetwork(message),
        _ => SyncError::Permanent(message),
    }
}

fn map_transport_error(err: ureq::Error) -> SyncError {
    let message = err.to_string();
    match err {
        ureq::Error::StatusCode(status) => {
            classify_status(status, "", RequestKind::Message, None)
        }
        _ => SyncError::TransientNetwork(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_compose_query() {
        let watermark = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap();
        assert_eq!(compose_query("", None), "");
        assert_eq!(
            compose_query("", Some(watermark)),
            format!("after:{}", watermark.timestamp() - 1)
        );
        assert_eq!(
            compose_query(" from:legal@firm.com ", Some(watermark)),
            format!("from:legal@firm.com after:{}", watermark.timestamp() - 1)
        );
    }

    #[test]
    fn test_decode_base64url() {
        assert_eq!(decode_base64url("aGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_base64url("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_base64url("-_8").unwrap(), vec![0xfb, 0xff]);
        assert!(decode_base64url("!!!").is_none());
    }

    #[test]
    fn test_classify_status() {
        let quota = r#"{"error":{"code":403,"message":"Daily Limit Exceeded","errors":[{"reason":"dailyLimitExceeded"}]}}"#;
        let rate = r#"{"error":{"code":403,"errors":[{"reason":"userRateLimitExceeded"}]}}"#;

        assert!(matches!(
            classify_status(403, quota, RequestKind::List, None),
            SyncError::QuotaExceeded(_)
        ));
        assert!(matches!(
            classify_status(403, rate, RequestKind::List, None),
            SyncError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(429, "", RequestKind::Message, Some(Duration::from_secs(2))),
            SyncError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            classify_status(401, "", RequestKind::List, None),
            SyncError::AuthExpired(_)
        ));
        assert!(matches!(
            classify_status(404, "", RequestKind::History, None),
            SyncError::CursorInvalid
        ));
        assert!(matches!(
            classify_status(404, "", RequestKind::Message, None),
            SyncError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(503, "", RequestKind::List, None),
            SyncError::TransientNetwork(_)
        ));
    }

    #[test]
    fn test_handle_for() {
        let transport = GmailTransport::new(&GmailConfig::default(), Duration::from_secs(5), 50);
        assert_eq!(transport.handle_for("18c2a").map(|h| h.id), Some("18c2a".to_string()));
        assert!(transport.handle_for("imap:INBOX:42").is_none());
        assert!(transport.handle_for("").is_none());
    }

    #[test]
    fn test_capabilities() {
        let transport = GmailTransport::new(&GmailConfig::default(), Duration::from_secs(5), 500);
        let caps = transport.capabilities();
        assert!(caps.supports_history_cursor);
        assert!(caps.supports_batch_fetch);
        assert!(!caps.oldest_first);
        assert_eq!(transport.batch_size, batch::MAX_BATCH);
    }
}
