//! Bounded polling and retry-with-recovery.
//!
//! Every synchronization in the harness goes through [`Poller::wait_until`]:
//! the guest is observed, never signalled, so "wait until X is true, but no
//! longer than T" is the only primitive that absorbs timing variance.
//!
//! The condition is always evaluated at least once, even for a zero
//! timeout, and once more at or after the deadline before giving up.
//! Between evaluations the poller sleeps for the poll interval, clamped to
//! the remaining time and never below the minimum sleep.

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Errors that may go away if the action is retried after a recovery.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for HarnessError {
    fn is_retryable(&self) -> bool {
        self.is_recoverable()
    }
}

/// Shortest sleep between two evaluations.
pub const MIN_SLEEP_FLOOR: Duration = Duration::from_millis(1);

/// Sleep schedule for bounded waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub min_sleep: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            min_sleep: Duration::from_millis(10),
        }
    }
}

impl Poller {
    pub fn new(interval: Duration, min_sleep: Duration) -> Self {
        Self {
            interval,
            min_sleep,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.poll_interval, config.min_poll_sleep)
    }

    /// Never below [`MIN_SLEEP_FLOOR`], whatever `min_sleep` says.
    fn next_sleep(&self, remaining: Duration) -> Duration {
        self.interval
            .min(remaining)
            .max(self.min_sleep)
            .max(MIN_SLEEP_FLOOR)
    }

    /// Wait until `condition` returns true.
    ///
    /// Returns the elapsed time on success, or [`HarnessError::Timeout`]
    /// carrying `message`.
    pub fn wait_until<F>(&self, timeout: Duration, message: &str, mut condition: F) -> HarnessResult<Duration>
    where
        F: FnMut() -> bool,
    {
        self.wait_until_ok(timeout, message, || Ok(condition()))
    }

    /// Like [`Poller::wait_until`], but the condition may fail.
    ///
    /// A failing evaluation counts as "not yet". The last failure is
    /// appended to the timeout message.
    pub fn wait_until_ok<F>(&self, timeout: Duration, message: &str, mut condition: F) -> HarnessResult<Duration>
    where
        F: FnMut() -> HarnessResult<bool>,
    {
        debug!(what = message, timeout_ms = timeout.as_millis() as u64, "waiting");
        let start = Instant::now();
        let mut last_error: Option<String> = None;
        let mut evaluations: u64 = 0;

        loop {
            evaluations += 1;
            match condition() {
                Ok(true) => {
                    let elapsed = start.elapsed();
                    debug!(
                        what = message,
                        elapsed_ms = elapsed.as_millis() as u64,
                        evaluations,
                        "condition satisfied"
                    );
                    return Ok(elapsed);
                }
                Ok(false) => {}
                Err(err) => {
                    debug!(what = message, error = %err, "condition evaluation failed");
                    last_error = Some(err.to_string());
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                let message = match last_error {
                    Some(err) => format!("{message} (last error: {err})"),
                    None => message.to_string(),
                };
                warn!(
                    what = %message,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = timeout.as_millis() as u64,
                    evaluations,
                    "wait timed out"
                );
                return Err(HarnessError::Timeout {
                    message,
                    elapsed,
                    timeout,
                });
            }
            std::thread::sleep(self.next_sleep(timeout - elapsed));
        }
    }
}

/// [`Poller::wait_until`] with the default schedule.
pub fn wait_until<F>(timeout: Duration, message: &str, condition: F) -> HarnessResult<Duration>
where
    F: FnMut() -> bool,
{
    Poller::default().wait_until(timeout, message, condition)
}

/// [`Poller::wait_until_ok`] with the default schedule.
pub fn wait_until_ok<F>(timeout: Duration, message: &str, condition: F) -> HarnessResult<Duration>
where
    F: FnMut() -> HarnessResult<bool>,
{
    Poller::default().wait_until_ok(timeout, message, condition)
}

/// Run `action` up to `attempts` times, calling `recovery` between tries.
///
/// Recovery is best effort: its failure is logged and the next attempt runs
/// anyway. Errors that are not retryable end the loop at once. The last
/// error is returned unchanged.
pub fn retry_with_recovery<T, E, A, R, RE>(attempts: u32, mut recovery: R, mut action: A) -> Result<T, E>
where
    A: FnMut() -> Result<T, E>,
    R: FnMut() -> Result<(), RE>,
    E: RetryableError + Display,
    RE: Display,
{
    let max_attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!(attempt, max_attempts, "starting attempt");
        match action() {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "attempt succeeded after recovery");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(attempt, max_attempts, error = %err, "attempt failed, running recovery");
                if let Err(recovery_err) = recovery() {
                    warn!(attempt, error = %recovery_err, "recovery failed, retrying anyway");
                }
                attempt += 1;
            }
            Err(err) => {
                warn!(
                    attempt,
                    retryable = err.is_retryable(),
                    error = %err,
                    "giving up"
                );
                return Err(err);
            }
        }
    }
}
