//! Cursor lifecycle for one sync scope
//!
//! Only the orchestrator's main loop holds a [`CursorManager`], and it only
//! records progress after a page is durably committed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::SyncResult;
use crate::models::{CursorState, ResumeMarker, ScopeKey, SyncCursor};
use crate::storage::RecordStore;
use crate::transport::Since;

/// Requested kind of run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Historical extraction from the beginning
    Full,
    /// Only what changed since the stored position
    Incremental,
}

/// Where a run starts
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub full: bool,
    pub since: Since,
    /// Page token of an interrupted full extraction on the same transport
    pub resume_page_token: Option<String>,
}

/// Progress of one committed page
#[derive(Debug, Clone, Default)]
pub struct PageCheckpoint {
    pub transport: String,
    /// Server position reported with the page
    pub position: Option<String>,
    pub next_page_token: Option<String>,
    /// Newest committed timestamp to fold into the watermark
    pub watermark: Option<DateTime<Utc>>,
    pub committed: u64,
}

/// Loads, advances and persists the cursor of one scope
pub struct CursorManager {
    store: Arc<dyn RecordStore>,
    cursor: SyncCursor,
}

impl CursorManager {
    /// Load the scope's cursor, or start a new one
    pub fn load(store: Arc<dyn RecordStore>, scope: ScopeKey) -> SyncResult<Self> {
        let cursor = store
            .load_cursor(&scope)?
            .unwrap_or_else(|| SyncCursor::new(scope));
        Ok(Self { store, cursor })
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Decide how the next run starts
    ///
    /// An invalidated cursor is reset first; it never resumes.
    pub fn begin(&mut self, mode: SyncMode, transport: &str) -> SyncResult<SyncPlan> {
        if self.cursor.state == CursorState::Invalidated {
            info!("[CURSOR] {} was invalidated, starting over", self.cursor.scope);
            self.transition(CursorState::Uninitialized);
            self.cursor.token = None;
            self.cursor.resume = None;
            self.persist()?;
        }

        if self.cursor.state == CursorState::Active && mode == SyncMode::Incremental {
            return Ok(SyncPlan {
                full: false,
                since: Since::Position {
                    token: self.cursor.token.clone(),
                    watermark: self.cursor.watermark,
                },
                resume_page_token: None,
            });
        }

        let resume_page_token = self
            .cursor
            .resume
            .as_ref()
            .filter(|r| r.transport == transport)
            .and_then(|r| r.page_token.clone());
        if let Some(token) = &resume_page_token {
            debug!("[CURSOR] Resuming full extraction of {} at {}", self.cursor.scope, token);
        }

        Ok(SyncPlan {
            full: true,
            since: Since::Beginning,
            resume_page_token,
        })
    }

    /// Remember the position to adopt once a full extraction completes
    pub fn mark_start(&mut self, transport: &str, pending_token: Option<String>) -> SyncResult<()> {
        self.cursor.resume = Some(ResumeMarker {
            transport: transport.to_string(),
            page_token: None,
            pending_token,
        });
        self.persist()
    }

    /// Record a durably committed page
    pub fn record_page(&mut self, page: PageCheckpoint) -> SyncResult<()> {
        let pending_token = page.position.or_else(|| {
            self.cursor
                .resume
                .as_ref()
                .and_then(|r| r.pending_token.clone())
        });
        self.cursor.resume = Some(ResumeMarker {
            transport: page.transport,
            page_token: page.next_page_token,
            pending_token,
        });
        self.cursor.advance(None, page.watermark, page.committed);
        self.persist()
    }

    /// Finish a run: the cursor becomes (or stays) active at `final_token`
    ///
    /// Without a final token the pending position captured during the run
    /// is adopted; without either the previous token is kept.
    pub fn complete(
        &mut self,
        final_token: Option<String>,
        watermark: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        let pending = self.cursor.resume.take().and_then(|r| r.pending_token);
        self.transition(CursorState::Active);
        self.cursor.advance(final_token.or(pending), watermark, 0);
        self.cursor.completed_at = Some(Utc::now());
        debug!(
            "[CURSOR] {} completed: token {:?}, watermark {:?}, covered {}",
            self.cursor.scope, self.cursor.token, self.cursor.watermark, self.cursor.covered
        );
        self.persist()
    }

    /// The server rejected the position: only a full resync may follow
    pub fn invalidate(&mut self) -> SyncResult<()> {
        warn!("[CURSOR] Position for {} rejected by server", self.cursor.scope);
        self.transition(CursorState::Invalidated);
        self.cursor.token = None;
        self.cursor.resume = None;
        self.persist()
    }

    fn transition(&mut self, next: CursorState) {
        if self.cursor.state.can_transition_to(next) {
            self.cursor.state = next;
        } else {
            debug!(
                "[CURSOR] Ignoring transition {} -> {} for {}",
                self.cursor.state.as_str(),
                next.as_str(),
                self.cursor.scope
            );
        }
    }

    fn persist(&self) -> SyncResult<()> {
        self.store.save_cursor(&self.cursor)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRecordStore;
    use chrono::TimeZone;

    fn manager(store: &Arc<InMemoryRecordStore>) -> CursorManager {
        CursorManager::load(store.clone(), ScopeKey::new("me@example.com", "")).unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, hour, 0, 0).unwrap()
    }

    fn page(watermark: DateTime<Utc>, committed: u64, next: Option<&str>) -> PageCheckpoint {
        PageCheckpoint {
            transport: "gmail".into(),
            position: None,
            next_page_token: next.map(String::from),
            watermark: Some(watermark),
            committed,
        }
    }

    #[test]
    fn test_new_scope_plans_full_run() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut mgr = manager(&store);
        let plan = mgr.begin(SyncMode::Incremental, "gmail").unwrap();
        assert!(plan.full);
        assert_eq!(plan.since, Since::Beginning);
        assert_eq!(plan.resume_page_token, None);
    }

    #[test]
    fn test_full_then_incremental() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut mgr = manager(&store);
        mgr.begin(SyncMode::Full, "gmail").unwrap();
        mgr.mark_start("gmail", Some("500".into())).unwrap();
        mgr.record_page(page(at(9), 2, Some("p2"))).unwrap();
        mgr.record_page(page(at(8), 1, None)).unwrap();
        mgr.complete(None, None).unwrap();

        let mut mgr = manager(&store);
        let cursor = mgr.cursor().clone();
        assert_eq!(cursor.state, CursorState::Active);
        assert_eq!(cursor.token.as_deref(), Some("500"));
        assert_eq!(cursor.watermark, Some(at(9)));
        assert_eq!(cursor.covered, 3);
        assert!(cursor.resume.is_none());
        assert!(cursor.completed_at.is_some());

        let plan = mgr.begin(SyncMode::Incremental, "gmail").unwrap();
        assert!(!plan.full);
        assert_eq!(
            plan.since,
            Since::Position {
                token: Some("500".into()),
                watermark: Some(at(9)),
            }
        );
    }

    #[test]
    fn test_interrupted_full_run_resumes_on_same_transport() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut mgr = manager(&store);
        mgr.begin(SyncMode::Full, "gmail").unwrap();
        mgr.mark_start("gmail", Some("500".into())).unwrap();
        mgr.record_page(page(at(9), 2, Some("p2"))).unwrap();
        drop(mgr);

        let mut mgr = manager(&store);
        assert!(mgr.cursor().advanced_at.is_some());
        assert!(mgr.cursor().completed_at.is_none());
        let plan = mgr.begin(SyncMode::Incremental, "gmail").unwrap();
        assert!(plan.full);
        assert_eq!(plan.resume_page_token.as_deref(), Some("p2"));

        // Page tokens are meaningless to another transport
        let plan = mgr.begin(SyncMode::Incremental, "imap").unwrap();
        assert_eq!(plan.resume_page_token, None);
    }

    #[test]
    fn test_invalidated_cursor_forces_full_resync() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut mgr = manager(&store);
        mgr.begin(SyncMode::Full, "gmail").unwrap();
        mgr.complete(Some("500".into()), Some(at(9))).unwrap();
        mgr.invalidate().unwrap();

        let mut mgr = manager(&store);
        assert_eq!(mgr.cursor().state, CursorState::Invalidated);
        assert_eq!(mgr.cursor().token, None);

        let plan = mgr.begin(SyncMode::Incremental, "gmail").unwrap();
        assert!(plan.full);
        assert_eq!(plan.since, Since::Beginning);
        assert_eq!(mgr.cursor().state, CursorState::Uninitialized);
        // Coverage and watermark never move backwards
        assert_eq!(mgr.cursor().watermark, Some(at(9)));
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut mgr = manager(&store);
        mgr.begin(SyncMode::Full, "imap").unwrap();
        mgr.record_page(page(at(12), 1, None)).unwrap();
        mgr.record_page(page(at(7), 1, None)).unwrap();
        mgr.complete(None, Some(at(6))).unwrap();

        assert_eq!(mgr.cursor().watermark, Some(at(12)));
        assert_eq!(mgr.cursor().covered, 2);
        assert_eq!(mgr.cursor().token, None);
        assert_eq!(mgr.cursor().state, CursorState::Active);
    }

    #[test]
    fn test_forced_full_run_keeps_active_cursor() {
        let store = Arc::new(InMemoryRecordStore::new());
        let mut mgr = manager(&store);
        mgr.begin(SyncMode::Full, "gmail").unwrap();
        mgr.complete(Some("100".into()), Some(at(9))).unwrap();

        let plan = mgr.begin(SyncMode::Full, "gmail").unwrap();
        assert!(plan.full);
        assert_eq!(mgr.cursor().state, CursorState::Active);
        assert_eq!(mgr.cursor().token.as_deref(), Some("100"));
    }
}
