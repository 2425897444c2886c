//! Renewable authentication handle
//!
//! Credential acquisition lives outside this crate. A [`CredentialSource`]
//! supplies credentials; an [`AuthHandle`] caches the current one and is
//! passed by reference into every transport call. Refresh happens only
//! through [`AuthHandle::refresh`].

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::{Arc, RwLock};

use crate::error::{SyncError, SyncResult};

/// Refresh this many seconds before the credential expires
const EXPIRY_SKEW_SECS: i64 = 300;

/// How a credential is presented to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// OAuth2 access token (HTTP bearer, IMAP XOAUTH2)
    Bearer,
    /// Account or app-specific password (IMAP LOGIN)
    Password,
}

/// A usable credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub secret: String,
    pub kind: CredentialKind,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn bearer(user: impl Into<String>, token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            user: user.into(),
            secret: token.into(),
            kind: CredentialKind::Bearer,
            expires_at,
        }
    }

    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: password.into(),
            kind: CredentialKind::Password,
            expires_at: None,
        }
    }

    /// Whether the credential is still usable, with a safety margin
    pub fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at.timestamp() > Utc::now().timestamp() + EXPIRY_SKEW_SECS,
            None => true,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .field("kind", &self.kind)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// External authentication collaborator
pub trait CredentialSource: Send + Sync {
    /// Produce a credential, from cache or storage
    fn acquire(&self) -> SyncResult<Credential>;

    /// Obtain a new credential; fails with `AuthExpired` when refresh fails
    fn refresh(&self) -> SyncResult<Credential>;
}

/// Fixed credential that never expires (app passwords, tests)
pub struct StaticCredential {
    credential: Credential,
}

impl StaticCredential {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

impl CredentialSource for StaticCredential {
    fn acquire(&self) -> SyncResult<Credential> {
        Ok(self.credential.clone())
    }

    fn refresh(&self) -> SyncResult<Credential> {
        Ok(self.credential.clone())
    }
}

/// Cached, renewable authentication handle for one transport
pub struct AuthHandle {
    source: Arc<dyn CredentialSource>,
    current: RwLock<Option<Credential>>,
}

impl AuthHandle {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            current: RwLock::new(None),
        }
    }

    /// Get a valid credential, refreshing first if it is near expiry
    pub fn get_valid_handle(&self) -> SyncResult<Credential> {
        if let Ok(guard) = self.current.read()
            && let Some(credential) = guard.as_ref()
            && credential.is_fresh()
        {
            return Ok(credential.clone());
        }

        let acquired = self.source.acquire()?;
        if acquired.is_fresh() {
            self.store(acquired.clone());
            return Ok(acquired);
        }

        debug!("[AUTH] Credential for {} near expiry, refreshing", acquired.user);
        self.refresh()
    }

    /// Force a refresh through the credential source
    pub fn refresh(&self) -> SyncResult<Credential> {
        match self.source.refresh() {
            Ok(credential) if credential.is_fresh() => {
                self.store(credential.clone());
                Ok(credential)
            }
            Ok(credential) => {
                warn!("[AUTH] Refreshed credential for {} is already expired", credential.user);
                self.clear();
                Err(SyncError::AuthExpired(
                    "refreshed credential already expired".to_string(),
                ))
            }
            Err(e) => {
                self.clear();
                Err(match e {
                    SyncError::AuthExpired(msg) => SyncError::AuthExpired(msg),
                    other => SyncError::AuthExpired(other.to_string()),
                })
            }
        }
    }

    /// Whether a usable credential can currently be produced
    pub fn is_valid(&self) -> bool {
        self.get_valid_handle().is_ok()
    }

    fn store(&self, credential: Credential) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Some(credential);
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.current.write() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Hands out an expired token first, then fresh ones on refresh
    struct RotatingSource {
        refreshes: AtomicU32,
        fail_refresh: bool,
    }

    impl CredentialSource for RotatingSource {
        fn acquire(&self) -> SyncResult<Credential> {
            Ok(Credential::bearer(
                "user@example.com",
                "stale",
                Some(Utc::now() - Duration::minutes(1)),
            ))
        }

        fn refresh(&self) -> SyncResult<Credential> {
            if self.fail_refresh {
                return Err(SyncError::Permanent("invalid_grant".into()));
            }
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credential::bearer(
                "user@example.com",
                format!("fresh-{}", n),
                Some(Utc::now() + Duration::hours(1)),
            ))
        }
    }

    #[test]
    fn test_expired_credential_is_refreshed() {
        let source = Arc::new(RotatingSource {
            refreshes: AtomicU32::new(0),
            fail_refresh: false,
        });
        let handle = AuthHandle::new(source.clone());

        let credential = handle.get_valid_handle().unwrap();
        assert_eq!(credential.secret, "fresh-1");

        // Cached credential is reused while fresh
        let again = handle.get_valid_handle().unwrap();
        assert_eq!(again.secret, "fresh-1");
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_refresh_is_auth_expired() {
        let handle = AuthHandle::new(Arc::new(RotatingSource {
            refreshes: AtomicU32::new(0),
            fail_refresh: true,
        }));

        let err = handle.get_valid_handle().unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired(_)));
        assert!(!handle.is_valid());
    }

    #[test]
    fn test_static_credential_is_always_valid() {
        let handle = AuthHandle::new(Arc::new(StaticCredential::new(Credential::password(
            "user@example.com",
            "app-password",
        ))));
        assert!(handle.is_valid());
        assert_eq!(handle.refresh().unwrap().kind, CredentialKind::Password);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credential = Credential::password("user@example.com", "hunter2");
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("hunter2"));
    }
}
