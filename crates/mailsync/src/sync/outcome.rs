//! Structured result of a run

use std::time::Duration;

use crate::error::ErrorClass;

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Candidates handled, whether they succeeded or failed
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Attachment records written (deduplicated bytes count once per record)
    pub attachments_stored: u64,
    pub duration: Duration,
}

impl RunStats {
    /// Nothing was stored and at least one message failed
    pub fn is_failure(&self) -> bool {
        self.failed > 0 && self.succeeded == 0
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every page was handled; individual messages may still have failed
    Completed,
    /// Stopped early; the cursor is at the last committed page
    Aborted { reason: String },
    /// Not started because the scope synced too recently
    Skipped,
}

/// Notable things that happened during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    TransportSelected {
        transport: &'static str,
    },
    TransportSwitched {
        from: &'static str,
        to: &'static str,
        class: ErrorClass,
    },
    /// The stored position was rejected and the run restarted as a full pass
    CursorInvalidated {
        transport: &'static str,
    },
    PageSizeChanged {
        from: usize,
        to: usize,
    },
}

/// Everything a caller learns from a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub stats: RunStats,
    pub status: RunStatus,
    pub events: Vec<RunEvent>,
}

impl RunOutcome {
    pub fn skipped() -> Self {
        Self {
            stats: RunStats::default(),
            status: RunStatus::Skipped,
            events: Vec::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted { .. })
    }

    /// Process exit code: 0 on success, 1 on abort or total failure
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Aborted { .. } => 1,
            RunStatus::Completed if self.stats.is_failure() => 1,
            RunStatus::Completed | RunStatus::Skipped => 0,
        }
    }

    /// Whether a transport switch happened during the run
    pub fn switched(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, RunEvent::TransportSwitched { .. }))
    }
}
