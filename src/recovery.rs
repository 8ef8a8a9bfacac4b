//! Error-recovery primitives: retry with exponential backoff and scoped
//! cleanup guards.
//!
//! Network and transient-resource failures are retried; everything else is
//! terminal and propagates immediately. [`CleanupGuard`] ties a cleanup
//! action to scope exit so partially-completed operations roll back even on
//! early `?` returns.

use crate::error::{ErrorKind, Result, SdkError};
use std::time::Duration;
use tracing::warn;

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// More attempts, shorter initial delay. For interactive flows where a
    /// transient blip should be ridden out quickly.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Fewer attempts, longer initial delay. For background work that should
    /// not hammer a struggling server.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 2_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Delay to sleep after attempt `attempt` (0-based) fails.
///
/// `delay = min(initial * multiplier^attempt, max)`, so the default config
/// yields 1s, 2s, 4s, 8s, 16s, then 30s capped.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let multiplier = config.backoff_multiplier.max(1.0);
    let ms = (config.initial_delay_ms as f64) * multiplier.powi(attempt.min(63) as i32);
    let capped = ms.min(config.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}

/// Whether a failure of this kind is worth retrying.
///
/// Retryable: network reachability/timeout/DNS failures and transient
/// resource exhaustion. Everything else (corruption, validation, storage,
/// cancellation) is terminal.
pub fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::NetworkUnreachable
            | ErrorKind::NetworkConnectionTimeout
            | ErrorKind::NetworkDNSFailure
            | ErrorKind::ResourceOutOfMemory
            | ErrorKind::ResourceThreadPoolExhausted
            | ErrorKind::ResourceGPUMemoryExhausted
    )
}

/// Run `op`, retrying retryable failures with exponential backoff.
///
/// `on_retry(attempt, error)` is invoked before each re-attempt with the
/// 0-based index of the attempt that just failed. The last error is returned
/// once attempts are exhausted or a terminal error is hit.
pub fn with_retry<T, F, H>(config: &RetryConfig, mut on_retry: H, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
    H: FnMut(u32, &SdkError),
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(e.kind) || attempt + 1 >= attempts {
                    return Err(e);
                }
                let delay = backoff_delay(config, attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                on_retry(attempt, &e);
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Runs a cleanup action when the scope exits.
///
/// `dismiss()` suppresses the action (the operation committed); `trigger()`
/// runs it immediately, exactly once. A panicking cleanup action is caught
/// and suppressed so it cannot escalate an already-failing scope. Multiple
/// guards in one scope run in LIFO drop order.
pub struct CleanupGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> CleanupGuard<F> {
    /// Arm a guard with `action`.
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// Disarm the guard; the action will not run.
    pub fn dismiss(&mut self) {
        self.action = None;
    }

    /// Run the action now. The destructor will not run it again.
    pub fn trigger(&mut self) {
        if let Some(action) = self.action.take() {
            run_suppressing_panic(action);
        }
    }
}

impl<F: FnOnce()> Drop for CleanupGuard<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            run_suppressing_panic(action);
        }
    }
}

fn run_suppressing_panic<F: FnOnce()>(action: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)).is_err() {
        warn!("cleanup action panicked; suppressed");
    }
}
