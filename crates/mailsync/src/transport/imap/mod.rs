//! IMAP transport
//!
//! One authenticated session is kept per transport and reused across
//! calls. Network or authentication failures drop the session so the next
//! call reconnects. Candidates are listed by ascending UID, which gives
//! oldest-first paging.

mod search;
mod session;

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;

pub use search::{build_search, translate_filter};
pub use session::{FetchedMessage, ImapConnector, ImapSession, NativeTlsConnector};

use crate::auth::AuthHandle;
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::transport::{
    CandidatePage, CandidateQuery, Capabilities, MimePayload, RawHandle, RawPayload, Since,
    Transport,
};

/// IMAP transport over a single selected folder
pub struct ImapTransport {
    connector: Box<dyn ImapConnector>,
    folder: String,
    session: Mutex<Option<Box<dyn ImapSession>>>,
}

impl ImapTransport {
    pub fn new(connector: Box<dyn ImapConnector>, folder: impl Into<String>) -> Self {
        Self {
            connector,
            folder: folder.into(),
            session: Mutex::new(None),
        }
    }

    /// Run `op` on the live session, connecting first if needed
    fn with_session<T>(
        &self,
        auth: &AuthHandle,
        op: impl FnOnce(&mut dyn ImapSession) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| SyncError::TransientNetwork("IMAP session lock poisoned".to_string()))?;

        if guard.is_none() {
            let credential = auth.get_valid_handle()?;
            let mut session = self.connector.connect(&credential)?;
            session.select(&self.folder)?;
            debug!("[IMAP] Selected {}", self.folder);
            *guard = Some(session);
        }

        let Some(session) = guard.as_mut() else {
            return Err(SyncError::TransientNetwork("no IMAP session".to_string()));
        };
        let result = op(session.as_mut());

        if let Err(e) = &result
            && matches!(e.class(), ErrorClass::Transient | ErrorClass::AuthExpired)
        {
            warn!("[IMAP] Dropping session after error: {}", e);
            *guard = None;
        }
        result
    }

    fn source_ref(&self, uid: u32) -> String {
        format!("imap:{}:{}", self.folder, uid)
    }

    fn to_payload(&self, message: FetchedMessage) -> SyncResult<RawPayload> {
        let source_ref = self.source_ref(message.uid);
        let bytes = message
            .body
            .ok_or_else(|| SyncError::parse(&source_ref, "server returned no message body"))?;

        Ok(RawPayload::Mime(MimePayload {
            labels: labels_from_flags(&self.folder, &message.flags),
            size: message.size.map(u64::from).or(Some(bytes.len() as u64)),
            internal_date: message.internal_date,
            source_ref,
            bytes,
        }))
    }

    /// Close the session, if one is open
    pub fn disconnect(&self) {
        if let Ok(mut guard) = self.session.lock()
            && let Some(mut session) = guard.take()
            && let Err(e) = session.logout()
        {
            debug!("[IMAP] Logout failed: {}", e);
        }
    }
}

impl Drop for ImapTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Transport for ImapTransport {
    fn name(&self) -> &'static str {
        "imap"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_history_cursor: false,
            supports_batch_fetch: true,
            supports_label_mutation: true,
            oldest_first: true,
            rate_limit_hint: None,
        }
    }

    fn fetch_candidates(&self, auth: &AuthHandle, query: &CandidateQuery) -> SyncResult<CandidatePage> {
        let watermark = match &query.since {
            Since::Beginning => None,
            Since::Position { watermark, .. } => *watermark,
        };
        let criteria = build_search(&query.filter, watermark);
        let after_uid = query.page_token.as_deref().and_then(parse_page_token);

        let mut uids = self.with_session(auth, |session| session.uid_search(&criteria))?;
        uids.sort_unstable();
        uids.dedup();

        let remaining: Vec<u32> = uids
            .into_iter()
            .filter(|uid| after_uid.is_none_or(|after| *uid > after))
            .collect();
        let page_size = query.page_size.max(1);
        let page = &remaining[..remaining.len().min(page_size)];

        let next_page_token = match page.last() {
            Some(last) if remaining.len() > page.len() => Some(format!("uid:{}", last)),
            _ => None,
        };

        debug!(
            "[IMAP] SEARCH {} -> {} candidates, page of {}",
            criteria,
            remaining.len(),
            page.len()
        );

        Ok(CandidatePage {
            handles: page.iter().map(|uid| RawHandle::new(uid.to_string())).collect(),
            next_page_token,
            position: None,
        })
    }

    fn fetch_full(&self, auth: &AuthHandle, handle: &RawHandle) -> SyncResult<RawPayload> {
        let uid = parse_uid(handle)?;
        let mut messages = self.with_session(auth, |session| session.uid_fetch(&uid.to_string()))?;

        match messages.iter().position(|m| m.uid == uid) {
            Some(index) => self.to_payload(messages.swap_remove(index)),
            None => Err(SyncError::Permanent(format!(
                "{} no longer exists",
                self.source_ref(uid)
            ))),
        }
    }

    fn fetch_batch(
        &self,
        auth: &AuthHandle,
        handles: &[RawHandle],
    ) -> SyncResult<Vec<SyncResult<RawPayload>>> {
        let uids: Vec<String> = handles
            .iter()
            .filter_map(|h| parse_uid(h).ok())
            .map(|uid| uid.to_string())
            .collect();
        let fetched = if uids.is_empty() {
            Vec::new()
        } else {
            let uid_set = uids.join(",");
            self.with_session(auth, |session| session.uid_fetch(&uid_set))?
        };
        let mut by_uid: HashMap<u32, FetchedMessage> =
            fetched.into_iter().map(|m| (m.uid, m)).collect();

        Ok(handles
            .iter()
            .map(|handle| {
                let uid = parse_uid(handle)?;
                match by_uid.remove(&uid) {
                    Some(message) => self.to_payload(message),
                    None => Err(SyncError::Permanent(format!(
                        "{} no longer exists",
                        self.source_ref(uid)
                    ))),
                }
            })
            .collect())
    }

    fn handle_for(&self, source_ref: &str) -> Option<RawHandle> {
        let rest = source_ref.strip_prefix("imap:")?;
        let (folder, uid) = rest.rsplit_once(':')?;
        (folder == self.folder && uid.parse::<u32>().is_ok()).then(|| RawHandle::new(uid))
    }

    fn modify_labels(
        &self,
        auth: &AuthHandle,
        handle: &RawHandle,
        add: &[String],
        remove: &[String],
    ) -> SyncResult<()> {
        let uid = parse_uid(handle)?;
        let mut changes = Vec::new();
        for label in add {
            changes.extend(flag_change(label, true));
        }
        for label in remove {
            changes.extend(flag_change(label, false));
        }

        self.with_session(auth, |session| {
            for change in &changes {
                session.uid_store(uid, change)?;
            }
            Ok(())
        })
    }
}

fn parse_uid(handle: &RawHandle) -> SyncResult<u32> {
    handle
        .id
        .parse()
        .map_err(|_| SyncError::Permanent(format!("invalid IMAP UID '{}'", handle.id)))
}

fn parse_page_token(token: &str) -> Option<u32> {
    token.strip_prefix("uid:")?.parse().ok()
}

/// Map IMAP flags onto the label vocabulary used by the API transport
fn labels_from_flags(folder: &str, flags: &[String]) -> Vec<String> {
    let mut labels = vec![folder.to_ascii_uppercase()];
    let mut seen = false;
    for flag in flags {
        match flag.as_str() {
            "\\Seen" => seen = true,
            "\\Flagged" => labels.push("STARRED".to_string()),
            "\\Draft" => labels.push("DRAFT".to_string()),
            f if !f.starts_with('\\') && !f.is_empty() => labels.push(f.to_string()),
            _ => {}
        }
    }
    if !seen {
        labels.push("UNREAD".to_string());
    }
    labels
}

/// `STORE` modification for one label change
fn flag_change(label: &str, add: bool) -> Option<String> {
    let (flag, add) = match label {
        "UNREAD" => ("\\Seen".to_string(), !add),
        "STARRED" => ("\\Flagged".to_string(), add),
        "DRAFT" => ("\\Draft".to_string(), add),
        keyword if is_atom(keyword) => (keyword.to_string(), add),
        _ => return None,
    };
    Some(format!("{}FLAGS ({})", if add { "+" } else { "-" }, flag))
}

fn is_atom(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_graphic() && !matches!(c, '(' | ')' | '{' | '%' | '*' | '"' | '\\' | ']')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, StaticCredential};
    use std::sync::Arc;

    #[derive(Default)]
    struct Script {
        messages: Vec<FetchedMessage>,
        connects: u32,
        searches: Vec<String>,
        stores: Vec<(u32, String)>,
        fail_next_search: bool,
    }

    struct ScriptedSession(Arc<Mutex<Script>>);

    impl ImapSession for ScriptedSession {
        fn select(&mut self, _folder: &str) -> SyncResult<()> {
            Ok(())
        }

        fn uid_search(&mut self, query: &str) -> SyncResult<Vec<u32>> {
            let mut script = self.0.lock().unwrap();
            script.searches.push(query.to_string());
            if std::mem::take(&mut script.fail_next_search) {
                return Err(SyncError::TransientNetwork("connection reset".into()));
            }
            Ok(script.messages.iter().rev().map(|m| m.uid).collect())
        }

        fn uid_fetch(&mut self, uid_set: &str) -> SyncResult<Vec<FetchedMessage>> {
            let wanted: Vec<u32> = uid_set.split(',').filter_map(|s| s.parse().ok()).collect();
            let script = self.0.lock().unwrap();
            Ok(script
                .messages
                .iter()
                .filter(|m| wanted.contains(&m.uid))
                .cloned()
                .collect())
        }

        fn uid_store(&mut self, uid: u32, modification: &str) -> SyncResult<()> {
            self.0
                .lock()
                .unwrap()
                .stores
                .push((uid, modification.to_string()));
            Ok(())
        }

        fn logout(&mut self) -> SyncResult<()> {
            Ok(())
        }
    }

    struct ScriptedConnector(Arc<Mutex<Script>>);

    impl ImapConnector for ScriptedConnector {
        fn connect(&self, _credential: &Credential) -> SyncResult<Box<dyn ImapSession>> {
            self.0.lock().unwrap().connects += 1;
            Ok(Box::new(ScriptedSession(self.0.clone())))
        }
    }

    fn message(uid: u32, flags: &[&str]) -> FetchedMessage {
        FetchedMessage {
            uid,
            internal_date: None,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            size: None,
            body: Some(format!("Message-ID: <{}@example.com>\r\n\r\nbody", uid).into_bytes()),
        }
    }

    fn setup(messages: Vec<FetchedMessage>) -> (ImapTransport, Arc<Mutex<Script>>, AuthHandle) {
        let script = Arc::new(Mutex::new(Script {
            messages,
            ..Script::default()
        }));
        let transport = ImapTransport::new(Box::new(ScriptedConnector(script.clone())), "INBOX");
        let auth = AuthHandle::new(Arc::new(StaticCredential::new(Credential::password(
            "user@example.com",
            "secret",
        ))));
        (transport, script, auth)
    }

    fn query(page_token: Option<String>) -> CandidateQuery {
        CandidateQuery {
            filter: String::new(),
            since: Since::Beginning,
            page_size: 2,
            page_token,
        }
    }

    #[test]
    fn test_pages_ascending_by_uid() {
        let (transport, script, auth) = setup((1..=5).map(|uid| message(uid, &[])).collect());

        let first = transport.fetch_candidates(&auth, &query(None)).unwrap();
        assert_eq!(
            first.handles.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
        assert_eq!(first.next_page_token.as_deref(), Some("uid:2"));

        let second = transport
            .fetch_candidates(&auth, &query(first.next_page_token))
            .unwrap();
        assert_eq!(second.handles[0].id, "3");

        let third = transport
            .fetch_candidates(&auth, &query(Some("uid:4".into())))
            .unwrap();
        assert_eq!(third.handles.len(), 1);
        assert!(third.next_page_token.is_none());

        // One connection serves every call
        assert_eq!(script.lock().unwrap().connects, 1);
        assert_eq!(script.lock().unwrap().searches[0], "ALL");
    }

    #[test]
    fn test_reconnects_after_transient_failure() {
        let (transport, script, auth) = setup(vec![message(7, &[])]);
        script.lock().unwrap().fail_next_search = true;

        assert!(transport.fetch_candidates(&auth, &query(None)).is_err());
        let page = transport.fetch_candidates(&auth, &query(None)).unwrap();

        assert_eq!(page.handles.len(), 1);
        assert_eq!(script.lock().unwrap().connects, 2);
    }

    #[test]
    fn test_fetch_batch_preserves_order_and_reports_missing() {
        let (transport, _script, auth) = setup(vec![message(1, &["\\Seen"]), message(3, &["\\Flagged"])]);
        let handles = vec![RawHandle::new("3"), RawHandle::new("2"), RawHandle::new("1")];

        let results = transport.fetch_batch(&auth, &handles).unwrap();
        assert_eq!(results.len(), 3);

        match &results[0] {
            Ok(RawPayload::Mime(payload)) => {
                assert_eq!(payload.source_ref, "imap:INBOX:3");
                assert!(payload.labels.contains(&"STARRED".to_string()));
                assert!(payload.labels.contains(&"UNREAD".to_string()));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(results[1], Err(SyncError::Permanent(_))));
        match &results[2] {
            Ok(RawPayload::Mime(payload)) => {
                assert!(!payload.labels.contains(&"UNREAD".to_string()));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_handle_for() {
        let (transport, _script, _auth) = setup(Vec::new());
        assert_eq!(transport.handle_for("imap:INBOX:42").map(|h| h.id), Some("42".to_string()));
        assert!(transport.handle_for("imap:Archive:42").is_none());
        assert!(transport.handle_for("18c2a").is_none());
    }

    #[test]
    fn test_modify_labels_maps_to_flags() {
        let (transport, script, auth) = setup(vec![message(9, &[])]);
        transport
            .modify_labels(
                &auth,
                &RawHandle::new("9"),
                &["STARRED".to_string(), "Legal".to_string()],
                &["UNREAD".to_string(), "has space".to_string()],
            )
            .unwrap();

        let stores = script.lock().unwrap().stores.clone();
        assert_eq!(
            stores,
            vec![
                (9, "+FLAGS (\\Flagged)".to_string()),
                (9, "+FLAGS (Legal)".to_string()),
                (9, "+FLAGS (\\Seen)".to_string()),
            ]
        );
    }
}
