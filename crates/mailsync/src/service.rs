//! Operational entry point
//!
//! [`SyncService`] wires the record store, attachment store and transports
//! into a [`Pipeline`] and exposes the operations a CLI or scheduler calls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{MessageId, ScopeKey, SyncCursor};
use crate::storage::{AttachmentStore, RecordStore, SqliteRecordStore};
use crate::sync::{
    CancelToken, ItemOutcome, Notifier, Pipeline, RunOutcome, RunStats, RunStatus, Sleeper,
    SyncMode, TransportSlot, cooldown_elapsed,
};
use crate::transport::RawHandle;

/// A filter kept up to date by repeated incremental syncs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncScope {
    pub filter: String,
    /// Syncs closer together than this are skipped
    pub min_interval: Duration,
}

impl SyncScope {
    pub fn new(filter: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            filter: filter.into(),
            min_interval,
        }
    }
}

/// Extraction and sync service for one mailbox
pub struct SyncService {
    config: SyncConfig,
    pipeline: Pipeline,
}

impl SyncService {
    /// Open the on-disk stores under `config.data_dir`
    pub fn open(
        config: SyncConfig,
        mailbox: impl Into<String>,
        transports: Vec<TransportSlot>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

        let store = SqliteRecordStore::new(config.database_path())?;
        let attachments = AttachmentStore::open(config.attachments_path())?;
        info!("[SYNC] Opened stores in {:?}", config.data_dir);

        Self::with_stores(config, mailbox, transports, Arc::new(store), Arc::new(attachments))
    }

    /// Use already opened stores
    pub fn with_stores(
        config: SyncConfig,
        mailbox: impl Into<String>,
        transports: Vec<TransportSlot>,
        store: Arc<dyn RecordStore>,
        attachments: Arc<AttachmentStore>,
    ) -> anyhow::Result<Self> {
        let pipeline = Pipeline::new(&config, mailbox, transports, store, attachments)?;
        Ok(Self { config, pipeline })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.pipeline = self.pipeline.with_sleeper(sleeper);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.pipeline = self.pipeline.with_notifier(notifier);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.pipeline.cancel_token()
    }

    /// Scope with the configured minimum interval
    pub fn scope(&self, filter: impl Into<String>) -> SyncScope {
        SyncScope::new(filter, self.config.min_sync_interval())
    }

    /// Pull messages matching `filter`, at most `max_results` of them
    pub fn extract(&self, filter: &str, max_results: Option<usize>, mode: SyncMode) -> RunOutcome {
        self.pipeline.run(filter, mode, max_results)
    }

    /// Extract one message by the transport reference a run reported
    pub fn extract_single(&self, transport: &str, reference: &str) -> SyncResult<ItemOutcome> {
        self.pipeline.extract_one(transport, &RawHandle::new(reference))
    }

    /// Incremental sync of a scope, skipped while its cooldown runs
    ///
    /// The cooldown starts when a run completes. A scope whose last run was
    /// interrupted is always due.
    pub fn sync(&self, scope: &SyncScope) -> RunOutcome {
        let last_completed = match self.cursor(&scope.filter) {
            Ok(cursor) => cursor
                .filter(|c| !c.interrupted())
                .and_then(|c| c.completed_at),
            Err(e) => {
                return RunOutcome {
                    stats: RunStats::default(),
                    status: RunStatus::Aborted {
                        reason: e.to_string(),
                    },
                    events: Vec::new(),
                };
            }
        };

        if !cooldown_elapsed(last_completed, scope.min_interval) {
            debug!(
                "[SYNC] Skipping [{}]: synced within the last {:?}",
                scope.filter, scope.min_interval
            );
            return RunOutcome::skipped();
        }
        self.pipeline.run(&scope.filter, SyncMode::Incremental, None)
    }

    /// Stored cursor for `filter` in this mailbox
    pub fn cursor(&self, filter: &str) -> SyncResult<Option<SyncCursor>> {
        let scope = ScopeKey::new(self.pipeline.mailbox(), filter);
        Ok(self.pipeline.store().load_cursor(&scope)?)
    }

    /// Change labels remotely, then on the stored record
    ///
    /// The first transport that supports label changes and recognizes the
    /// record's source reference is used.
    pub fn apply_labels(&self, id: &MessageId, add: &[String], remove: &[String]) -> SyncResult<()> {
        let store = self.pipeline.store();
        let mut record = store
            .get_message(id)?
            .ok_or_else(|| SyncError::Permanent(format!("unknown message {}", id)))?;

        let (slot, handle) = self
            .pipeline
            .transports()
            .filter(|slot| slot.transport.capabilities().supports_label_mutation)
            .find_map(|slot| {
                slot.transport
                    .handle_for(&record.source_ref)
                    .map(|handle| (slot, handle))
            })
            .ok_or_else(|| {
                SyncError::Permanent(format!(
                    "no transport can change labels of {}",
                    record.source_ref
                ))
            })?;

        slot.transport
            .modify_labels(&slot.auth, &handle, add, remove)?;

        for label in remove {
            record.labels.remove(label);
        }
        record.labels.extend(add.iter().cloned());
        store.upsert_message(&record)?;

        info!(
            "[SYNC] Labels of {} changed via {}: +{:?} -{:?}",
            id,
            slot.transport.name(),
            add,
            remove
        );
        Ok(())
    }
}
