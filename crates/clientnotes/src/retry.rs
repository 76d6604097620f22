//! Bounded retry with backoff for flaky remote operations.
//!
//! The caller decides what is worth retrying: `RetryPolicy::run` takes a
//! classifier that returns `true` for transient failures. Fatal failures
//! propagate on the first occurrence, transient ones are retried until the
//! attempt budget is spent.

use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed { delay_ms: u64 },
    /// `step * attempt`.
    Linear { step_ms: u64 },
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Zero-delay schedule, used by tests and dry runs.
    pub const NONE: Backoff = Backoff::Fixed { delay_ms: 0 };

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Linear { step_ms } => step_ms.saturating_mul(u64::from(attempt)),
            Backoff::Exponential { base_ms, max_ms } => {
                let shift = (attempt - 1).min(32);
                base_ms.saturating_mul(1u64 << shift).min(max_ms)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    /// The underlying error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(e) => e,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Authentication: few attempts, exponential backoff from 2s.
    pub fn login() -> Self {
        Self::new(
            3,
            Backoff::Exponential {
                base_ms: 2_000,
                max_ms: 16_000,
            },
        )
    }

    /// Dataset export: the remote report page is slow and stale-prone.
    pub fn export() -> Self {
        Self::new(7, Backoff::Fixed { delay_ms: 3_000 })
    }

    /// Per-record lookup: stale handles back off linearly.
    pub fn lookup() -> Self {
        Self::new(5, Backoff::Linear { step_ms: 1_000 })
    }

    /// Runs `op` until it succeeds, fails fatally, or the attempt budget is
    /// spent. `op` receives the 1-based attempt number.
    pub fn run<T, E, F, C>(&self, label: &str, mut op: F, is_transient: C) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        C: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{} succeeded on attempt {}/{}", label, attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) if !is_transient(&e) => {
                    log::warn!("{} failed with non-retryable error: {}", label, e);
                    return Err(RetryError::Fatal(e));
                }
                Err(e) if attempt >= max_attempts => {
                    log::warn!(
                        "{} failed (attempt {}/{}), giving up: {}",
                        label,
                        attempt,
                        max_attempts,
                        e
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.backoff.delay_after(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        label,
                        attempt,
                        max_attempts,
                        delay.as_millis(),
                        e
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Backoff::Fixed { delay_ms: 1_000 })
    }
}
