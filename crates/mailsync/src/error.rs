//! Error taxonomy for the sync core
//!
//! Every failure that crosses a transport, normalizer, or storage boundary
//! is expressed as a [`SyncError`]. The pipeline never inspects messages to
//! decide what to do; it branches on [`SyncError::class`].

use std::time::Duration;

/// Coarse classification driving retry, switch, and abort decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retry with backoff (timeouts, 5xx, rate limiting)
    Transient,
    /// Refresh credentials, then retry; escalates to a transport switch
    AuthExpired,
    /// Quota exhausted or circuit open: switch transport or abort
    QuotaExceeded,
    /// Position token rejected by the server: full resync
    CursorInvalid,
    /// Request can never succeed: record and skip
    Permanent,
    /// Malformed message payload: per-message, non-fatal
    Parse,
    /// Storage unavailable: abort the run immediately
    Fatal,
    /// Run-scoped cancellation was requested
    Cancelled,
}

/// Errors produced by the extraction and sync core
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to parse message {id}: {reason}")]
    Parse { id: String, reason: String },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Sync position expired or invalid")]
    CursorInvalid,

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Operation not supported by transport {transport}: {operation}")]
    Unsupported {
        transport: &'static str,
        operation: &'static str,
    },

    #[error("Circuit open for transport {0}")]
    CircuitOpen(String),

    #[error("Storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("Run cancelled")]
    Cancelled,
}

impl SyncError {
    /// Shorthand for a per-message parse failure
    pub fn parse(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error for the retry controller and orchestrator
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Parse { .. } => ErrorClass::Parse,
            SyncError::TransientNetwork(_) | SyncError::RateLimited { .. } => ErrorClass::Transient,
            SyncError::AuthExpired(_) => ErrorClass::AuthExpired,
            SyncError::QuotaExceeded(_) | SyncError::CircuitOpen(_) => ErrorClass::QuotaExceeded,
            SyncError::CursorInvalid => ErrorClass::CursorInvalid,
            SyncError::Permanent(_) | SyncError::Unsupported { .. } => ErrorClass::Permanent,
            SyncError::Storage(_) => ErrorClass::Fatal,
            SyncError::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Whether this error only affects the message being processed
    pub fn is_per_item(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Parse | ErrorClass::Permanent | ErrorClass::Transient
        )
    }

    /// Server-suggested delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Storage(err)
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(SyncError::parse("m1", "bad").class(), ErrorClass::Parse);
        assert_eq!(
            SyncError::TransientNetwork("timeout".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SyncError::RateLimited { retry_after: None }.class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SyncError::AuthExpired("401".into()).class(),
            ErrorClass::AuthExpired
        );
        assert_eq!(
            SyncError::QuotaExceeded("daily".into()).class(),
            ErrorClass::QuotaExceeded
        );
        assert_eq!(
            SyncError::CircuitOpen("gmail".into()).class(),
            ErrorClass::QuotaExceeded
        );
        assert_eq!(SyncError::CursorInvalid.class(), ErrorClass::CursorInvalid);
        assert_eq!(
            SyncError::Permanent("gone".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            SyncError::Storage(anyhow::anyhow!("disk full")).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_per_item_errors() {
        assert!(SyncError::parse("m1", "truncated").is_per_item());
        assert!(SyncError::Permanent("gone".into()).is_per_item());
        assert!(!SyncError::Storage(anyhow::anyhow!("locked")).is_per_item());
        assert!(!SyncError::QuotaExceeded("daily".into()).is_per_item());
    }

    #[test]
    fn test_anyhow_becomes_storage() {
        let err: SyncError = anyhow::anyhow!("database is locked").into();
        assert!(matches!(err, SyncError::Storage(_)));
        assert!(err.to_string().contains("database is locked"));
    }
}
