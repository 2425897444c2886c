//! Pipeline orchestrator
//!
//! Drives one run: pull a page of candidates, fetch and normalize the page
//! on the worker pool, then commit message by message on the calling
//! thread (attachments first, record last). The cursor only moves after a
//! page has been committed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rayon::ThreadPool;
use rayon::prelude::*;

use super::cancel::CancelToken;
use super::cursor::{CursorManager, PageCheckpoint, SyncMode};
use super::outcome::{RunEvent, RunOutcome, RunStats, RunStatus};
use super::progress::{ItemOutcome, Notifier, ProgressEvent};
use super::rate_limit::RateLimiter;
use super::retry::{CircuitBreaker, Retrier, RetryPolicy, Sleeper, ThreadSleeper};
use crate::auth::AuthHandle;
use crate::config::{PageConfig, SyncConfig};
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::models::{MessageId, ScopeKey};
use crate::normalize::{AttachmentSource, Normalized, normalize};
use crate::storage::{AttachmentStore, RecordStore};
use crate::transport::{CandidateQuery, Capabilities, RawHandle, RawPayload, Since, Transport};

/// A transport together with the credential handle it uses
#[derive(Clone)]
pub struct TransportSlot {
    pub transport: Arc<dyn Transport>,
    pub auth: Arc<AuthHandle>,
}

impl TransportSlot {
    pub fn new(transport: Arc<dyn Transport>, auth: Arc<AuthHandle>) -> Self {
        Self { transport, auth }
    }
}

/// Per-transport state that outlives a single run
struct Lane {
    slot: TransportSlot,
    caps: Capabilities,
    breaker: CircuitBreaker,
    limiter: Option<RateLimiter>,
}

impl Lane {
    fn name(&self) -> &'static str {
        self.slot.transport.name()
    }
}

/// Mutable state of the run in progress
struct RunState {
    lane: usize,
    /// Transports that failed during this run
    excluded: HashSet<usize>,
    full: bool,
    since: Since,
    page_token: Option<String>,
    page_size: usize,
    clean_pages: u32,
    /// Watermark the run started from; None for full runs
    start_watermark: Option<DateTime<Utc>>,
    /// Newest committed message timestamp seen in this run
    newest: Option<DateTime<Utc>>,
    restarted: bool,
    stats: RunStats,
    events: Vec<RunEvent>,
}

impl RunState {
    fn new(page_size: usize) -> Self {
        Self {
            lane: 0,
            excluded: HashSet::new(),
            full: false,
            since: Since::Beginning,
            page_token: None,
            page_size,
            clean_pages: 0,
            start_watermark: None,
            newest: None,
            restarted: false,
            stats: RunStats::default(),
            events: Vec::new(),
        }
    }
}

struct FetchedPage {
    items: Vec<(RawHandle, SyncResult<Normalized>)>,
    retried: bool,
}

struct StoredMessage {
    id: MessageId,
    attachments: usize,
    received_at: DateTime<Utc>,
}

#[derive(Default)]
struct PageCommit {
    processed: u64,
    newest: Option<DateTime<Utc>>,
}

/// Extraction and sync orchestrator for one mailbox
pub struct Pipeline {
    mailbox: String,
    lanes: Vec<Lane>,
    store: Arc<dyn RecordStore>,
    attachments: Arc<AttachmentStore>,
    page: PageConfig,
    batch_size: usize,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    notifier: Notifier,
    cancel: CancelToken,
    pool: ThreadPool,
}

impl Pipeline {
    /// Build a pipeline over `transports`, in order of preference
    pub fn new(
        config: &SyncConfig,
        mailbox: impl Into<String>,
        transports: Vec<TransportSlot>,
        store: Arc<dyn RecordStore>,
        attachments: Arc<AttachmentStore>,
    ) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("mailsync-fetch-{}", i))
            .build()
            .context("Failed to build fetch worker pool")?;

        let lanes = transports
            .into_iter()
            .map(|slot| {
                let caps = slot.transport.capabilities();
                Lane {
                    breaker: CircuitBreaker::from_config(slot.transport.name(), &config.breaker),
                    limiter: caps.rate_limit_hint.map(RateLimiter::new),
                    caps,
                    slot,
                }
            })
            .collect();

        Ok(Self {
            mailbox: mailbox.into(),
            lanes,
            store,
            attachments,
            page: config.page.clone(),
            batch_size: config.batch_fetch_size.max(1),
            policy: RetryPolicy::from_config(&config.retry),
            sleeper: Arc::new(ThreadSleeper),
            notifier: Notifier::new(config.notify_timeout()),
            cancel: CancelToken::new(),
            pool,
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels runs of this pipeline
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn attachments(&self) -> &Arc<AttachmentStore> {
        &self.attachments
    }

    /// Configured transports, in order of preference
    pub fn transports(&self) -> impl Iterator<Item = &TransportSlot> {
        self.lanes.iter().map(|lane| &lane.slot)
    }

    /// Run one extraction or sync for `filter`
    ///
    /// Always returns an outcome; an abort leaves the cursor at the last
    /// committed page.
    pub fn run(&self, filter: &str, mode: SyncMode, max_results: Option<usize>) -> RunOutcome {
        let started = Instant::now();
        let min = self.page.min.max(1);
        let mut run = RunState::new(self.page.initial.clamp(min, self.page.max.max(min)));
        info!("[SYNC] Starting {:?} run for {} [{}]", mode, self.mailbox, filter);

        let result = self.drive(&mut run, filter, mode, max_results);
        run.stats.duration = started.elapsed();

        let status = match result {
            Ok(()) => RunStatus::Completed,
            Err(e) => {
                warn!("[SYNC] Run aborted ({:?}): {}", e.class(), e);
                RunStatus::Aborted {
                    reason: e.to_string(),
                }
            }
        };
        info!(
            "[SYNC] Run finished: {} processed, {} succeeded, {} failed, {} attachments in {:?}",
            run.stats.processed,
            run.stats.succeeded,
            run.stats.failed,
            run.stats.attachments_stored,
            run.stats.duration
        );

        RunOutcome {
            stats: run.stats,
            status,
            events: run.events,
        }
    }

    fn drive(
        &self,
        run: &mut RunState,
        filter: &str,
        mode: SyncMode,
        max_results: Option<usize>,
    ) -> SyncResult<()> {
        let scope = ScopeKey::new(self.mailbox.clone(), filter);
        let mut cursor = CursorManager::load(Arc::clone(&self.store), scope)?;

        run.lane = self
            .select_lane(&run.excluded)
            .ok_or_else(|| SyncError::AuthExpired("no transport has a usable credential".into()))?;
        run.events.push(RunEvent::TransportSelected {
            transport: self.lanes[run.lane].name(),
        });
        self.plan(run, &mut cursor, mode)?;

        loop {
            self.cancel.check()?;
            let remaining = max_results.map(|max| max.saturating_sub(run.stats.processed as usize));
            if remaining == Some(0) {
                info!("[SYNC] Reached limit of {:?} messages", max_results);
                return Ok(());
            }

            let lane = &self.lanes[run.lane];
            let query = CandidateQuery {
                filter: filter.to_string(),
                since: run.since.clone(),
                page_size: remaining.map_or(run.page_size, |r| r.min(run.page_size)),
                page_token: run.page_token.clone(),
            };

            let (listed, list_state) = self
                .retrier(lane)
                .run("fetch_candidates", &lane.slot.auth, |auth| {
                    lane.slot.transport.fetch_candidates(auth, &query)
                });
            let page = match listed {
                Ok(page) => page,
                Err(e) => {
                    self.recover(run, &mut cursor, e)?;
                    continue;
                }
            };

            let mut handles = page.handles;
            let truncated = remaining.is_some_and(|r| handles.len() > r);
            if let Some(r) = remaining {
                handles.truncate(r);
            }
            debug!(
                "[SYNC] {} returned {} candidates (page size {})",
                lane.name(),
                handles.len(),
                query.page_size
            );

            let fetched = match self.fetch_page(lane, &handles) {
                Ok(fetched) => fetched,
                Err(e) => {
                    self.recover(run, &mut cursor, e)?;
                    continue;
                }
            };

            let committed = self.commit_page(run, lane, fetched.items)?;
            if let Some(newest) = committed.newest {
                run.newest = Some(run.newest.map_or(newest, |n| n.max(newest)));
            }

            // A truncated page is listed again when resuming
            let resume_token = if truncated {
                query.page_token.clone()
            } else {
                page.next_page_token.clone()
            };
            cursor.record_page(PageCheckpoint {
                transport: lane.name().to_string(),
                position: page.position,
                next_page_token: if run.full { resume_token } else { None },
                watermark: if lane.caps.oldest_first {
                    committed.newest
                } else {
                    None
                },
                committed: committed.processed,
            })?;
            self.adapt_page_size(run, list_state.retried() || fetched.retried);

            if truncated {
                continue;
            }
            match page.next_page_token {
                Some(token) => run.page_token = Some(token),
                None => {
                    cursor.complete(None, run.newest)?;
                    return Ok(());
                }
            }
        }
    }

    /// Fetch, normalize and commit one message outside of a run
    ///
    /// `transport` names the transport that issued `handle`, as reported in
    /// [`ItemOutcome::Failed`]. Per-message failures come back as a failed
    /// outcome; storage failures and cancellation as errors. The cursor is
    /// left alone.
    pub fn extract_one(&self, transport: &str, handle: &RawHandle) -> SyncResult<ItemOutcome> {
        let lane = self
            .lanes
            .iter()
            .find(|lane| lane.name() == transport)
            .ok_or_else(|| SyncError::Permanent(format!("unknown transport {}", transport)))?;

        self.throttle(lane)?;
        let (fetched, _) = self
            .retrier(lane)
            .run("fetch_full", &lane.slot.auth, |a| lane.slot.transport.fetch_full(a, handle));
        let outcome = fetched
            .and_then(normalize)
            .and_then(|normalized| self.commit(lane, handle, normalized));

        match outcome {
            Ok(stored) => {
                info!("[SYNC] Extracted {} from {}", stored.id, lane.name());
                self.notifier.committed(&stored.id);
                Ok(ItemOutcome::Stored {
                    id: stored.id,
                    attachments: stored.attachments,
                })
            }
            Err(e) if matches!(e.class(), ErrorClass::Fatal | ErrorClass::Cancelled) => Err(e),
            Err(e) => {
                warn!("[SYNC] Could not extract {} from {}: {}", handle.id, lane.name(), e);
                Ok(ItemOutcome::Failed {
                    transport: lane.name(),
                    reference: handle.id.clone(),
                    class: e.class(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Ask the cursor where to start and capture the pending position
    fn plan(&self, run: &mut RunState, cursor: &mut CursorManager, mode: SyncMode) -> SyncResult<()> {
        let lane = &self.lanes[run.lane];
        let plan = cursor.begin(mode, lane.name())?;

        run.full = plan.full;
        run.since = plan.since;
        run.page_token = plan.resume_page_token.clone();
        run.start_watermark = if plan.full {
            None
        } else {
            cursor.cursor().watermark
        };

        if plan.full && plan.resume_page_token.is_none() {
            let (position, _) = self
                .retrier(lane)
                .run("current_position", &lane.slot.auth, |auth| {
                    lane.slot.transport.current_position(auth)
                });
            let pending = position.unwrap_or_else(|e| {
                warn!("[SYNC] Could not read position from {}: {}", lane.name(), e);
                None
            });
            cursor.mark_start(lane.name(), pending)?;
        }

        info!(
            "[SYNC] {} run on {} from {:?}",
            if run.full { "Full" } else { "Incremental" },
            lane.name(),
            run.since
        );
        Ok(())
    }

    /// Handle a page-level failure: restart, switch transport, or abort
    fn recover(&self, run: &mut RunState, cursor: &mut CursorManager, err: SyncError) -> SyncResult<()> {
        match err.class() {
            ErrorClass::CursorInvalid if !run.restarted => {
                let transport = self.lanes[run.lane].name();
                cursor.invalidate()?;
                run.events.push(RunEvent::CursorInvalidated { transport });
                run.restarted = true;
                self.plan(run, cursor, SyncMode::Full)
            }
            ErrorClass::QuotaExceeded | ErrorClass::AuthExpired | ErrorClass::Transient => {
                self.switch(run, err)
            }
            _ => Err(err),
        }
    }

    fn switch(&self, run: &mut RunState, err: SyncError) -> SyncResult<()> {
        let from = run.lane;
        run.excluded.insert(from);
        let Some(to) = self.select_lane(&run.excluded) else {
            return Err(err);
        };

        let (from_lane, to_lane) = (&self.lanes[from], &self.lanes[to]);
        warn!(
            "[SYNC] Switching from {} to {} after {:?}: {}",
            from_lane.name(),
            to_lane.name(),
            err.class(),
            err
        );
        run.events.push(RunEvent::TransportSwitched {
            from: from_lane.name(),
            to: to_lane.name(),
            class: err.class(),
        });

        run.since = switch_since(
            run.full,
            from_lane.caps.oldest_first,
            run.newest,
            run.start_watermark,
        );
        run.page_token = None;
        run.lane = to;
        Ok(())
    }

    /// First transport not yet failed whose circuit is closed and whose
    /// credential is usable
    fn select_lane(&self, excluded: &HashSet<usize>) -> Option<usize> {
        self.lanes
            .iter()
            .enumerate()
            .find(|(i, lane)| {
                !excluded.contains(i) && !lane.breaker.is_open() && lane.slot.auth.is_valid()
            })
            .map(|(i, _)| i)
    }

    fn retrier<'a>(&'a self, lane: &'a Lane) -> Retrier<'a> {
        Retrier::new(&self.policy, self.sleeper.as_ref(), &self.cancel).with_breaker(&lane.breaker)
    }

    fn throttle(&self, lane: &Lane) -> SyncResult<()> {
        match &lane.limiter {
            Some(limiter) => limiter.acquire(self.sleeper.as_ref(), &self.cancel),
            None => Ok(()),
        }
    }

    /// Fetch and normalize a page on the worker pool, preserving order
    fn fetch_page(&self, lane: &Lane, handles: &[RawHandle]) -> SyncResult<FetchedPage> {
        let chunk_size = if lane.caps.supports_batch_fetch {
            self.batch_size
        } else {
            1
        };

        let chunks: Vec<SyncResult<(Vec<SyncResult<Normalized>>, bool)>> = self.pool.install(|| {
            handles
                .par_chunks(chunk_size)
                .map(|chunk| self.fetch_chunk(lane, chunk))
                .collect()
        });

        let mut items = Vec::with_capacity(handles.len());
        let mut retried = false;
        for (chunk, result) in handles.chunks(chunk_size).zip(chunks) {
            let (results, chunk_retried) = result?;
            retried |= chunk_retried;
            items.extend(chunk.iter().cloned().zip(results));
        }
        Ok(FetchedPage { items, retried })
    }

    fn fetch_chunk(
        &self,
        lane: &Lane,
        chunk: &[RawHandle],
    ) -> SyncResult<(Vec<SyncResult<Normalized>>, bool)> {
        self.cancel.check()?;
        let auth = &lane.slot.auth;
        let transport = &lane.slot.transport;
        let mut retried = false;

        let payloads: Vec<SyncResult<RawPayload>> = if let [handle] = chunk {
            self.throttle(lane)?;
            let (result, state) = self
                .retrier(lane)
                .run("fetch_full", auth, |a| transport.fetch_full(a, handle));
            retried |= state.retried();
            vec![result]
        } else {
            self.throttle(lane)?;
            let (result, state) = self
                .retrier(lane)
                .run("fetch_batch", auth, |a| transport.fetch_batch(a, chunk));
            retried |= state.retried();
            match result {
                Ok(mut results) => {
                    results.resize_with(chunk.len(), || {
                        Err(SyncError::TransientNetwork(
                            "message missing from batch response".into(),
                        ))
                    });
                    results
                }
                Err(e) if is_page_level(&e) => return Err(e),
                Err(e) => {
                    warn!("[SYNC] Batch of {} failed: {}", chunk.len(), e);
                    chunk.iter().map(|_| Err(replicate(&e))).collect()
                }
            }
        };

        let mut normalized = Vec::with_capacity(chunk.len());
        for (handle, payload) in chunk.iter().zip(payloads) {
            let payload = match payload {
                // Batch items that failed transiently get a second chance alone
                Err(e) if chunk.len() > 1 && e.class() == ErrorClass::Transient => {
                    debug!("[SYNC] Refetching {} alone: {}", handle.id, e);
                    self.throttle(lane)?;
                    let (result, _) = self
                        .retrier(lane)
                        .run("fetch_full", auth, |a| transport.fetch_full(a, handle));
                    retried = true;
                    result
                }
                other => other,
            };

            match payload {
                Ok(payload) => normalized.push(normalize(payload)),
                Err(e) if is_page_level(&e) => return Err(e),
                Err(e) => normalized.push(Err(e)),
            }
        }
        Ok((normalized, retried))
    }

    /// Commit fetched messages in order; per-message failures are counted
    fn commit_page(
        &self,
        run: &mut RunState,
        lane: &Lane,
        items: Vec<(RawHandle, SyncResult<Normalized>)>,
    ) -> SyncResult<PageCommit> {
        let mut page = PageCommit::default();

        for (handle, result) in items {
            self.cancel.check()?;
            let committed = result.and_then(|normalized| self.commit(lane, &handle, normalized));
            let outcome = match committed {
                Err(e) if e.class() == ErrorClass::Cancelled => return Err(e),
                other => other,
            };
            run.stats.processed += 1;
            page.processed += 1;

            let item = match outcome {
                Ok(stored) => {
                    run.stats.succeeded += 1;
                    run.stats.attachments_stored += stored.attachments as u64;
                    let received = stored.received_at;
                    page.newest = Some(page.newest.map_or(received, |n| n.max(received)));
                    self.notifier.committed(&stored.id);
                    ItemOutcome::Stored {
                        id: stored.id,
                        attachments: stored.attachments,
                    }
                }
                Err(e) => {
                    run.stats.failed += 1;
                    if e.class() == ErrorClass::Fatal {
                        return Err(e);
                    }
                    warn!(
                        "[SYNC] Skipping {} from {} ({:?}): {}",
                        handle.id,
                        lane.name(),
                        e.class(),
                        e
                    );
                    ItemOutcome::Failed {
                        transport: lane.name(),
                        reference: handle.id.clone(),
                        class: e.class(),
                        reason: e.to_string(),
                    }
                }
            };

            self.notifier.progress(ProgressEvent {
                processed: run.stats.processed,
                succeeded: run.stats.succeeded,
                failed: run.stats.failed,
                item,
            });
        }
        Ok(page)
    }

    /// Store attachment bytes, then the record, as one logical unit
    fn commit(&self, lane: &Lane, handle: &RawHandle, normalized: Normalized) -> SyncResult<StoredMessage> {
        let Normalized {
            record,
            attachments,
            received_at,
        } = normalized;

        let mut stored = Vec::with_capacity(attachments.len());
        for stub in attachments {
            let bytes = match stub.source {
                AttachmentSource::Inline(bytes) => bytes,
                AttachmentSource::Remote { attachment_id } => {
                    self.throttle(lane)?;
                    let (result, _) = self.retrier(lane).run("fetch_attachment", &lane.slot.auth, |a| {
                        lane.slot.transport.fetch_attachment(a, handle, &attachment_id)
                    });
                    result?
                }
            };
            let attachment = self
                .attachments
                .put(&record.id, record.date, &bytes, &stub.filename, &stub.content_type)
                .map_err(SyncError::Storage)?;
            stored.push(attachment);
        }

        self.store.commit_message(&record, &stored)?;
        debug!(
            "[SYNC] Committed {} with {} attachment(s)",
            record.id,
            stored.len()
        );

        Ok(StoredMessage {
            received_at,
            attachments: stored.len(),
            id: record.id,
        })
    }

    fn adapt_page_size(&self, run: &mut RunState, retried: bool) {
        let before = run.page_size;
        if retried {
            run.clean_pages = 0;
            run.page_size = (run.page_size / 2).max(self.page.min.max(1));
        } else {
            run.clean_pages += 1;
            if run.clean_pages >= self.page.grow_after && run.page_size < self.page.max {
                run.page_size = (run.page_size * 2).min(self.page.max);
                run.clean_pages = 0;
            }
        }
        if run.page_size != before {
            debug!("[SYNC] Page size {} -> {}", before, run.page_size);
            run.events.push(RunEvent::PageSizeChanged {
                from: before,
                to: run.page_size,
            });
        }
    }
}

/// Failures that stop the whole page rather than one message
fn is_page_level(err: &SyncError) -> bool {
    matches!(
        err.class(),
        ErrorClass::QuotaExceeded
            | ErrorClass::AuthExpired
            | ErrorClass::CursorInvalid
            | ErrorClass::Fatal
            | ErrorClass::Cancelled
    )
}

/// Per-message copy of a failure that hit a whole batch
fn replicate(err: &SyncError) -> SyncError {
    match err.class() {
        ErrorClass::Transient => SyncError::TransientNetwork(err.to_string()),
        _ => SyncError::Permanent(err.to_string()),
    }
}

/// Where the next transport picks up after a switch
///
/// An oldest-first transport has committed everything up to the newest
/// timestamp it delivered. A newest-first one gives no such guarantee, so
/// the run falls back to the watermark it started from.
fn switch_since(
    full: bool,
    previous_oldest_first: bool,
    newest: Option<DateTime<Utc>>,
    start_watermark: Option<DateTime<Utc>>,
) -> Since {
    let floor = if previous_oldest_first {
        newest.or(start_watermark)
    } else {
        start_watermark
    };
    match floor {
        Some(watermark) => Since::Position {
            token: None,
            watermark: Some(watermark),
        },
        None if full => Since::Beginning,
        None => Since::Position {
            token: None,
            watermark: None,
        },
    }
}
