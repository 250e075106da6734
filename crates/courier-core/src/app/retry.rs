//! Retry - bounded re-invocation of an operation with backoff.
//!
//! Per call:
//! 1. run the operation (attempt = 1)
//! 2. on failure, ask the policy whether the error is retryable
//!    - not retryable -> return it immediately, no backoff
//!    - retryable and attempts remain -> sleep `backoff(attempt)`, try again
//!    - retryable and attempts exhausted -> return the last error as is
//!
//! The error that comes out is always the one the operation produced, never a
//! wrapper, so callers match on the same variants with or without retries.
//!
//! Retrying re-runs the whole operation. Keep `is_retryable` narrow: a failure
//! after a partial external side effect must not qualify.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::domain::errors::{CourierError, ErrorKind};
use crate::ports::{Sleeper, TokioSleeper};

/// Strategy answering how often, how long, and for what.
pub trait RetryPolicy: Send + Sync {
    fn max_attempts(&self) -> u32;

    /// Delay before attempt `attempt + 1`, where `attempt` is the one that just failed (1-indexed).
    fn backoff(&self, attempt: u32) -> Duration;

    fn is_retryable(&self, error: &CourierError) -> bool;
}

/// 3 attempts, fixed 100ms backoff, optimistic conflicts only.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl DefaultRetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn backoff(&self, _attempt: u32) -> Duration {
        self.backoff
    }

    fn is_retryable(&self, error: &CourierError) -> bool {
        error.is_concurrency_conflict()
    }
}

/// Exponential backoff: `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
///
/// With base_delay=100ms, multiplier=2.0:
/// - attempt 1: 100ms
/// - attempt 2: 200ms
/// - attempt 3: 400ms
///
/// Retries every `ErrorKind::Transient` failure.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    fn is_retryable(&self, error: &CourierError) -> bool {
        error.kind() == ErrorKind::Transient
    }
}

/// Per-call override. Zero means "use the policy's value".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub backoff_millis: u64,
}

impl RetryOptions {
    pub fn new(max_attempts: u32, backoff_millis: u64) -> Self {
        Self {
            max_attempts,
            backoff_millis,
        }
    }

    fn effective_max_attempts(&self, policy: &dyn RetryPolicy) -> u32 {
        let attempts = if self.max_attempts > 0 {
            self.max_attempts
        } else {
            policy.max_attempts()
        };
        attempts.max(1)
    }

    fn effective_backoff(&self, policy: &dyn RetryPolicy, attempt: u32) -> Duration {
        if self.backoff_millis > 0 {
            Duration::from_millis(self.backoff_millis)
        } else {
            policy.backoff(attempt)
        }
    }
}

/// Applies a `RetryPolicy` around an operation at the call site.
///
/// ```ignore
/// let retrier = Retrier::new(DefaultRetryPolicy::default());
/// retrier
///     .run(RetryOptions::default(), |_attempt| bus.dispatch(cmd.clone()))
///     .await?;
/// ```
pub struct Retrier<P> {
    policy: P,
    sleeper: Arc<dyn Sleeper>,
}

impl<P: RetryPolicy> Retrier<P> {
    pub fn new(policy: P) -> Self {
        Self::with_sleeper(policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(policy: P, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// `op` receives the 1-indexed attempt number.
    pub async fn run<T, F, Fut>(&self, options: RetryOptions, op: F) -> Result<T, CourierError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CourierError>>,
    {
        self.run_inner(options, None, op).await
    }

    /// Like `run`, but a `true` on `cancel` interrupts the backoff sleep and
    /// prevents further attempts. Returns `CourierError::Cancelled` in that case.
    pub async fn run_cancellable<T, F, Fut>(
        &self,
        options: RetryOptions,
        cancel: watch::Receiver<bool>,
        op: F,
    ) -> Result<T, CourierError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CourierError>>,
    {
        self.run_inner(options, Some(cancel), op).await
    }

    async fn run_inner<T, F, Fut>(
        &self,
        options: RetryOptions,
        mut cancel: Option<watch::Receiver<bool>>,
        mut op: F,
    ) -> Result<T, CourierError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CourierError>>,
    {
        let max_attempts = options.effective_max_attempts(&self.policy);
        let mut attempt = 1;

        loop {
            if is_cancelled(&cancel) {
                return Err(CourierError::Cancelled);
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) {
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::error!(attempt, max_attempts, error = %err, "retry attempts exhausted");
                return Err(err);
            }

            let delay = options.effective_backoff(&self.policy, attempt);
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable failure, backing off"
            );

            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = wait_for_cancel(&mut cancel) => {
                    tracing::debug!(attempt, "retry cancelled during backoff");
                    return Err(CourierError::Cancelled);
                }
            }
            attempt += 1;
        }
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves once cancellation is requested; never resolves without a receiver
/// or after the sender is gone.
async fn wait_for_cancel(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await
}
