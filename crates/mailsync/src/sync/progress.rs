//! Progress and enrichment notification channels
//!
//! Both channels are bounded. Sends wait at most the configured timeout and
//! are dropped after that, so a slow consumer never stalls a run.

use std::time::Duration;

use flume::{Receiver, SendTimeoutError, Sender};
use log::debug;

use crate::error::ErrorClass;
use crate::models::MessageId;

/// Per-message progress report
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Running totals after this message
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub item: ItemOutcome,
}

/// What happened to one message
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Stored {
        id: MessageId,
        attachments: usize,
    },
    Failed {
        /// Transport that issued `reference`
        transport: &'static str,
        /// Transport reference or canonical id, whichever is known
        reference: String,
        class: ErrorClass,
        reason: String,
    },
}

/// Handed to the enrichment collaborator once a record is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedMessage {
    pub id: MessageId,
}

/// Create a bounded progress channel
pub fn progress_channel(capacity: usize) -> (Sender<ProgressEvent>, Receiver<ProgressEvent>) {
    flume::bounded(capacity.max(1))
}

/// Create a bounded enrichment channel
pub fn enrichment_channel(
    capacity: usize,
) -> (Sender<CommittedMessage>, Receiver<CommittedMessage>) {
    flume::bounded(capacity.max(1))
}

/// Optional outbound channels for one run
#[derive(Clone)]
pub struct Notifier {
    progress: Option<Sender<ProgressEvent>>,
    enrichment: Option<Sender<CommittedMessage>>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            progress: None,
            enrichment: None,
            timeout,
        }
    }

    pub fn with_progress(mut self, sender: Sender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_enrichment(mut self, sender: Sender<CommittedMessage>) -> Self {
        self.enrichment = Some(sender);
        self
    }

    pub fn progress(&self, event: ProgressEvent) {
        if let Some(sender) = &self.progress {
            send(sender, event, self.timeout, "progress");
        }
    }

    pub fn committed(&self, id: &MessageId) {
        if let Some(sender) = &self.enrichment {
            send(sender, CommittedMessage { id: id.clone() }, self.timeout, "enrichment");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

fn send<T>(sender: &Sender<T>, value: T, timeout: Duration, channel: &str) {
    match sender.send_timeout(value, timeout) {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(_)) => {
            debug!("[SYNC] {} channel full, dropping notification", channel);
        }
        Err(SendTimeoutError::Disconnected(_)) => {}
    }
}
