//! IMAP session seam
//!
//! [`ImapSession`] covers the handful of commands the transport issues.
//! The production implementation wraps an `imap::Session` over native-tls;
//! tests substitute a scripted session through [`ImapConnector`].

use chrono::{DateTime, FixedOffset};
use log::{debug, info};
use native_tls::TlsStream;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::auth::{Credential, CredentialKind};
use crate::error::{SyncError, SyncResult};

/// Items requested for a full message fetch; `BODY.PEEK` leaves `\Seen` alone
const FETCH_ITEMS: &str = "(UID INTERNALDATE FLAGS RFC822.SIZE BODY.PEEK[])";

/// A message returned by `UID FETCH`
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    pub uid: u32,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub flags: Vec<String>,
    pub size: Option<u32>,
    pub body: Option<Vec<u8>>,
}

/// Commands issued against a selected mailbox
pub trait ImapSession: Send {
    fn select(&mut self, folder: &str) -> SyncResult<()>;

    /// `UID SEARCH`, returning matching UIDs in any order
    fn uid_search(&mut self, query: &str) -> SyncResult<Vec<u32>>;

    /// `UID FETCH` of complete messages for a UID set
    fn uid_fetch(&mut self, uid_set: &str) -> SyncResult<Vec<FetchedMessage>>;

    /// `UID STORE` with a raw flag modification (`+FLAGS (\Flagged)`)
    fn uid_store(&mut self, uid: u32, modification: &str) -> SyncResult<()>;

    fn logout(&mut self) -> SyncResult<()>;
}

/// Opens authenticated sessions
pub trait ImapConnector: Send + Sync {
    fn connect(&self, credential: &Credential) -> SyncResult<Box<dyn ImapSession>>;
}

/// XOAUTH2 SASL mechanism
struct XOAuth2<'a> {
    user: &'a str,
    token: &'a str,
}

impl imap::Authenticator for XOAuth2<'_> {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.token)
    }
}

/// Implicit-TLS connector with connect and read/write timeouts
pub struct NativeTlsConnector {
    host: String,
    port: u16,
    timeout: Duration,
}

impl NativeTlsConnector {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    fn open_stream(&self) -> SyncResult<TlsStream<TcpStream>> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| SyncError::TransientNetwork(format!("Failed to resolve {}: {}", self.host, e)))?
            .next()
            .ok_or_else(|| SyncError::TransientNetwork(format!("No address for {}", self.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| SyncError::TransientNetwork(format!("Failed to connect to {}: {}", addr, e)))?;
        tcp.set_read_timeout(Some(self.timeout))
            .and_then(|_| tcp.set_write_timeout(Some(self.timeout)))
            .map_err(|e| SyncError::TransientNetwork(e.to_string()))?;

        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| SyncError::Permanent(format!("TLS setup failed: {}", e)))?;
        tls.connect(&self.host, tcp)
            .map_err(|e| SyncError::TransientNetwork(format!("TLS handshake failed: {}", e)))
    }
}

impl ImapConnector for NativeTlsConnector {
    fn connect(&self, credential: &Credential) -> SyncResult<Box<dyn ImapSession>> {
        debug!("[IMAP] Connecting to {}:{}", self.host, self.port);
        let mut client = imap::Client::new(self.open_stream()?);
        client.read_greeting().map_err(map_imap_error)?;

        let session = match credential.kind {
            CredentialKind::Bearer => {
                let auth = XOAuth2 {
                    user: &credential.user,
                    token: &credential.secret,
                };
                client
                    .authenticate("XOAUTH2", &auth)
                    .map_err(|(e, _)| map_login_error(e))?
            }
            CredentialKind::Password => client
                .login(&credential.user, &credential.secret)
                .map_err(|(e, _)| map_login_error(e))?,
        };

        info!("[IMAP] Authenticated as {}", credential.user);
        Ok(Box::new(NativeSession { inner: session }))
    }
}

struct NativeSession {
    inner: imap::Session<TlsStream<TcpStream>>,
}

impl ImapSession for NativeSession {
    fn select(&mut self, folder: &str) -> SyncResult<()> {
        self.inner.select(folder).map_err(map_imap_error)?;
        Ok(())
    }

    fn uid_search(&mut self, query: &str) -> SyncResult<Vec<u32>> {
        let uids = self.inner.uid_search(query).map_err(map_imap_error)?;
        Ok(uids.into_iter().collect())
    }

    fn uid_fetch(&mut self, uid_set: &str) -> SyncResult<Vec<FetchedMessage>> {
        let fetches = self
            .inner
            .uid_fetch(uid_set, FETCH_ITEMS)
            .map_err(map_imap_error)?;

        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                Some(FetchedMessage {
                    uid: fetch.uid?,
                    internal_date: fetch.internal_date(),
                    flags: fetch.flags().iter().map(|f| f.to_string()).collect(),
                    size: fetch.size,
                    body: fetch.body().map(<[u8]>::to_vec),
                })
            })
            .collect())
    }

    fn uid_store(&mut self, uid: u32, modification: &str) -> SyncResult<()> {
        self.inner
            .uid_store(uid.to_string(), modification)
            .map_err(map_imap_error)?;
        Ok(())
    }

    fn logout(&mut self) -> SyncResult<()> {
        self.inner.logout().map_err(map_imap_error)
    }
}

/// Failed LOGIN/AUTHENTICATE: bad credentials unless the server says otherwise
fn map_login_error(err: imap::Error) -> SyncError {
    match err {
        imap::Error::No(msg) | imap::Error::Bad(msg) => match classify_response(&msg) {
            SyncError::Permanent(_) => SyncError::AuthExpired(msg),
            other => other,
        },
        other => map_imap_error(other),
    }
}

pub(crate) fn map_imap_error(err: imap::Error) -> SyncError {
    match err {
        imap::Error::Io(e) => SyncError::TransientNetwork(e.to_string()),
        imap::Error::ConnectionLost => SyncError::TransientNetwork("connection lost".to_string()),
        imap::Error::No(msg) | imap::Error::Bad(msg) => classify_response(&msg),
        other => SyncError::TransientNetwork(other.to_string()),
    }
}

/// Classify a tagged NO/BAD response by its response code or text
pub(crate) fn classify_response(text: &str) -> SyncError {
    let upper = text.to_ascii_uppercase();
    if upper.contains("OVERQUOTA")
        || upper.contains("LIMIT")
        || upper.contains("EXCEEDED")
    {
        SyncError::QuotaExceeded(text.to_string())
    } else if upper.contains("THROTTLED") || upper.contains("UNAVAILABLE") || upper.contains("INUSE") {
        SyncError::TransientNetwork(text.to_string())
    } else if upper.contains("AUTHENTICATIONFAILED") || upper.contains("AUTHORIZATIONFAILED") {
        SyncError::AuthExpired(text.to_string())
    } else {
        SyncError::Permanent(text.to_string())
    }
}
