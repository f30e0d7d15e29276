//! Bounded retries for transient I/O failures.
//!
//! Only [`TxError::Transient`] failures are retried. Everything else
//! (missing paths, lock timeouts, integrity failures) surfaces on first
//! occurrence.

use crate::error::{Result, TxError};

use std::thread;
use std::time::Duration;

/// Default delay schedule in milliseconds. Attempts beyond its length reuse
/// the last value.
pub const DEFAULT_SCHEDULE_MS: [u64; 5] = [100, 500, 1000, 2000, 5000];

/// Fixed backoff schedule applied between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_SCHEDULE_MS)
    }
}

impl RetryPolicy {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    pub fn from_millis(schedule: &[u64]) -> Self {
        Self::new(schedule.iter().copied().map(Duration::from_millis).collect())
    }

    /// Retries without waiting.
    pub fn immediate() -> Self {
        Self::new(Vec::new())
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let Some(last) = self.schedule.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempt.saturating_sub(1) as usize).min(last);
        self.schedule[index]
    }

    /// Runs `op` until it succeeds, fails permanently, or `max_attempts` is reached.
    ///
    /// `context` names the operation in logs and in the aggregated error.
    /// Sleeping between attempts only parks the calling thread.
    pub fn run<T, F>(&self, context: &str, max_attempts: u32, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!("{} succeeded on attempt {}", context, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    log::debug!("{} failed permanently: {}", context, e);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    log::error!("{} failed after {} attempt(s): {}", context, attempt, e);
                    return Err(TxError::RetriesExhausted {
                        context: context.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        context,
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    thread::sleep(delay);
                }
            }
        }
    }
}
