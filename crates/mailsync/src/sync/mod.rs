//! Extraction and incremental sync engine
//!
//! Runs are idempotent: every commit is an upsert, so a run can be
//! repeated or resumed after a crash without duplicating records.

mod cancel;
mod cursor;
mod outcome;
mod pipeline;
mod progress;
mod rate_limit;
mod retry;
mod timing;

pub use cancel::CancelToken;
pub use cursor::{CursorManager, PageCheckpoint, SyncMode, SyncPlan};
pub use outcome::{RunEvent, RunOutcome, RunStats, RunStatus};
pub use pipeline::{Pipeline, TransportSlot};
pub use progress::{
    CommittedMessage, ItemOutcome, Notifier, ProgressEvent, enrichment_channel, progress_channel,
};
pub use rate_limit::RateLimiter;
pub use retry::{
    CircuitBreaker, RecordingSleeper, Retrier, RetryPolicy, RetryState, Sleeper, ThreadSleeper,
};
pub use timing::cooldown_elapsed;
