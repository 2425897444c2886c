//! Persistent incremental-sync position

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an independent sync scope
///
/// Cursors are keyed by mailbox and filter so several scopes over the same
/// mailbox never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub mailbox: String,
    pub filter: String,
}

impl ScopeKey {
    pub fn new(mailbox: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            filter: filter.into(),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.filter.is_empty() {
            write!(f, "{}", self.mailbox)
        } else {
            write!(f, "{} [{}]", self.mailbox, self.filter)
        }
    }
}

/// Lifecycle state of a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CursorState {
    /// No usable position: the next run is a full extraction
    Uninitialized,
    /// Holds a valid position
    Active,
    /// The server rejected the position; only a full resync may follow
    Invalidated,
}

impl CursorState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: CursorState) -> bool {
        use CursorState::*;
        matches!(
            (self, next),
            (Uninitialized, Uninitialized)
                | (Uninitialized, Active)
                | (Active, Active)
                | (Active, Invalidated)
                | (Invalidated, Uninitialized)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CursorState::Uninitialized => "uninitialized",
            CursorState::Active => "active",
            CursorState::Invalidated => "invalidated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uninitialized" => Some(CursorState::Uninitialized),
            "active" => Some(CursorState::Active),
            "invalidated" => Some(CursorState::Invalidated),
            _ => None,
        }
    }
}

/// Checkpoint of a full extraction in progress
///
/// The page token is only meaningful to the transport that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMarker {
    pub transport: String,
    pub page_token: Option<String>,
    /// Position captured at the start of the extraction, adopted on completion
    pub pending_token: Option<String>,
}

/// Incremental-sync position for one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub scope: ScopeKey,
    pub state: CursorState,
    /// Opaque server-assigned position token
    pub token: Option<String>,
    /// Latest committed message timestamp, used when no token is usable
    pub watermark: Option<DateTime<Utc>>,
    /// When the cursor last advanced
    pub advanced_at: Option<DateTime<Utc>>,
    /// When a run over this scope last reached the end of its candidates
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of messages covered so far
    pub covered: u64,
    pub resume: Option<ResumeMarker>,
    /// Schema version for migrations
    pub sync_version: u32,
}

impl SyncCursor {
    /// Create a cursor that has never synced
    pub fn new(scope: ScopeKey) -> Self {
        Self {
            scope,
            state: CursorState::Uninitialized,
            token: None,
            watermark: None,
            advanced_at: None,
            completed_at: None,
            covered: 0,
            resume: None,
            sync_version: 1,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Active
    }

    /// A run started or committed pages after the last completed one
    pub fn interrupted(&self) -> bool {
        if self.resume.is_some() {
            return true;
        }
        match (self.advanced_at, self.completed_at) {
            (Some(advanced), Some(completed)) => advanced > completed,
            (advanced, None) => advanced.is_some(),
            (None, Some(_)) => false,
        }
    }

    /// Record a committed batch
    ///
    /// Watermark and coverage never move backwards; a token replaces the old
    /// one only when supplied.
    pub fn advance(
        &mut self,
        token: Option<String>,
        watermark: Option<DateTime<Utc>>,
        committed: u64,
    ) {
        if let Some(token) = token {
            self.token = Some(token);
        }
        self.watermark = match (self.watermark, watermark) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => old.or(new),
        };
        self.covered += committed;
        self.advanced_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scope() -> ScopeKey {
        ScopeKey::new("user@example.com", "from:legal@firm.com")
    }

    #[test]
    fn test_new_cursor_is_uninitialized() {
        let cursor = SyncCursor::new(scope());
        assert_eq!(cursor.state, CursorState::Uninitialized);
        assert!(!cursor.is_valid());
        assert_eq!(cursor.covered, 0);
    }

    #[test]
    fn test_transitions() {
        use CursorState::*;
        assert!(Uninitialized.can_transition_to(Active));
        assert!(Active.can_transition_to(Active));
        assert!(Active.can_transition_to(Invalidated));
        assert!(Invalidated.can_transition_to(Uninitialized));

        assert!(!Invalidated.can_transition_to(Active));
        assert!(!Active.can_transition_to(Uninitialized));
        assert!(!Uninitialized.can_transition_to(Invalidated));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut cursor = SyncCursor::new(scope());
        let later = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        cursor.advance(Some("100".into()), Some(later), 3);
        cursor.advance(None, Some(earlier), 2);

        assert_eq!(cursor.watermark, Some(later));
        assert_eq!(cursor.token.as_deref(), Some("100"));
        assert_eq!(cursor.covered, 5);
        assert!(cursor.advanced_at.is_some());
    }

    #[test]
    fn test_interrupted_after_progress_past_completion() {
        let mut cursor = SyncCursor::new(scope());
        assert!(!cursor.interrupted());

        cursor.advance(None, None, 2);
        assert!(cursor.interrupted());

        cursor.completed_at = Some(Utc::now());
        assert!(!cursor.interrupted());

        cursor.resume = Some(ResumeMarker {
            transport: "gmail".into(),
            page_token: Some("p2".into()),
            pending_token: None,
        });
        assert!(cursor.interrupted());

        cursor.resume = None;
        cursor.advance(None, None, 1);
        cursor.completed_at = cursor.advanced_at.map(|a| a - chrono::Duration::seconds(1));
        assert!(cursor.interrupted());
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            CursorState::Uninitialized,
            CursorState::Active,
            CursorState::Invalidated,
        ] {
            assert_eq!(CursorState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CursorState::parse("bogus"), None);
    }

    #[test]
    fn test_serialization() {
        let mut cursor = SyncCursor::new(scope());
        cursor.advance(Some("12345".into()), None, 1);
        let json = serde_json::to_string(&cursor).unwrap();
        let deserialized: SyncCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(cursor, deserialized);
    }
}
