//! Retry with exponential backoff, credential refresh and circuit breaking

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;

use super::cancel::CancelToken;
use crate::auth::AuthHandle;
use crate::config::{BreakerConfig, RetryConfig};
use crate::error::{ErrorClass, SyncError, SyncResult};

/// Granularity of cancellable sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Something that can wait between attempts
pub trait Sleeper: Send + Sync {
    /// Sleep for `duration`, returning `Cancelled` early if the run is cancelled
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> SyncResult<()>;
}

/// Sleeps on the current thread in short slices
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> SyncResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Records requested delays without sleeping
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order
    pub fn slept(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> SyncResult<()> {
        cancel.check()?;
        self.slept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        Ok(())
    }
}

/// Backoff schedule and attempt limits
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter as a fraction of the exponential delay
    pub jitter: f64,
    pub max_auth_refreshes: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_auth_refreshes: config.max_auth_refreshes,
        }
    }

    /// Delay before retry number `retry` (0-based)
    ///
    /// `base * 2^retry` plus jitter in `[0, jitter * base * 2^retry)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, retry: u32, rng: &mut impl Rng) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);

        let span = exponential.as_secs_f64() * self.jitter;
        let jitter = if span > 0.0 {
            Duration::try_from_secs_f64(rng.gen_range(0.0..span)).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Attempt bookkeeping for one operation
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    /// Backoff delays applied, in order
    pub delays: Vec<Duration>,
    pub auth_refreshes: u32,
    pub last_class: Option<ErrorClass>,
    pub next_eligible: Option<Instant>,
}

impl RetryState {
    /// Whether the operation needed more than one attempt
    pub fn retried(&self) -> bool {
        self.attempts > 1
    }
}

/// Runs fallible transport operations under a [`RetryPolicy`]
pub struct Retrier<'a> {
    policy: &'a RetryPolicy,
    sleeper: &'a dyn Sleeper,
    cancel: &'a CancelToken,
    breaker: Option<&'a CircuitBreaker>,
}

impl<'a> Retrier<'a> {
    pub fn new(policy: &'a RetryPolicy, sleeper: &'a dyn Sleeper, cancel: &'a CancelToken) -> Self {
        Self {
            policy,
            sleeper,
            cancel,
            breaker: None,
        }
    }

    /// Count transient failures against `breaker` and fail fast while it is open
    pub fn with_breaker(mut self, breaker: &'a CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Run `f` until it succeeds or fails in a way retrying cannot fix
    ///
    /// Transient errors back off and retry up to the attempt limit.
    /// `AuthExpired` refreshes the handle and retries up to the refresh
    /// limit. Everything else is returned immediately.
    pub fn run<T>(
        &self,
        op: &str,
        auth: &AuthHandle,
        mut f: impl FnMut(&AuthHandle) -> SyncResult<T>,
    ) -> (SyncResult<T>, RetryState) {
        let mut state = RetryState::default();
        let mut rng = rand::thread_rng();

        loop {
            if let Err(e) = self.cancel.check() {
                state.last_class = Some(e.class());
                return (Err(e), state);
            }
            if let Some(breaker) = self.breaker
                && let Err(e) = breaker.check()
            {
                state.last_class = Some(e.class());
                return (Err(e), state);
            }

            state.attempts += 1;
            let err = match f(auth) {
                Ok(value) => {
                    if let Some(breaker) = self.breaker {
                        breaker.record_success();
                    }
                    return (Ok(value), state);
                }
                Err(err) => err,
            };

            let class = err.class();
            state.last_class = Some(class);

            match class {
                ErrorClass::Transient => {
                    if let Some(breaker) = self.breaker {
                        breaker.record_failure();
                    }
                    if state.attempts >= self.policy.max_attempts {
                        warn!(
                            "[RETRY] {} failed after {} attempts: {}",
                            op, state.attempts, err
                        );
                        return (Err(err), state);
                    }

                    let computed = self.policy.backoff(state.attempts - 1, &mut rng);
                    let delay = match err.retry_after() {
                        Some(hint) => hint.max(computed).min(self.policy.max_delay),
                        None => computed,
                    };
                    debug!(
                        "[RETRY] {} attempt {} failed ({}), retrying in {:?}",
                        op, state.attempts, err, delay
                    );
                    state.delays.push(delay);
                    state.next_eligible = Some(Instant::now() + delay);

                    if let Err(e) = self.sleeper.sleep(delay, self.cancel) {
                        state.last_class = Some(e.class());
                        return (Err(e), state);
                    }
                }
                ErrorClass::AuthExpired => {
                    if state.auth_refreshes >= self.policy.max_auth_refreshes
                        || state.attempts >= self.policy.max_attempts
                    {
                        warn!("[RETRY] {} still unauthorized after refresh: {}", op, err);
                        return (Err(err), state);
                    }
                    state.auth_refreshes += 1;
                    debug!("[RETRY] {} unauthorized, refreshing credential", op);
                    if let Err(e) = auth.refresh() {
                        return (Err(e), state);
                    }
                }
                _ => return (Err(err), state),
            }
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    /// Times of consecutive transient failures inside the window
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
}

/// Trips after repeated transient failures from one transport
///
/// While open every call fails fast with `CircuitOpen`. After the window
/// elapses one call is let through; a success closes the circuit again.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    window: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            window,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(name, config.threshold, Duration::from_secs(config.window_secs))
    }

    pub fn is_open(&self) -> bool {
        self.lock()
            .open_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Fail fast while the circuit is open
    pub fn check(&self) -> SyncResult<()> {
        if self.is_open() {
            Err(SyncError::CircuitOpen(self.name.clone()))
        } else {
            Ok(())
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        state.failures.push_back(now);
        while let Some(&oldest) = state.failures.front() {
            if now.duration_since(oldest) > self.window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
        if state.failures.len() >= self.threshold as usize && state.open_until.is_none_or(|u| u <= now) {
            warn!(
                "[RETRY] Circuit for {} opened after {} transient failures",
                self.name,
                state.failures.len()
            );
            state.open_until = Some(now + self.window);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
