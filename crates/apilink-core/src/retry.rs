use std::{future::Future, time::Duration};

use tracing::warn;

use crate::{error::ClassifiedError, types::ErrorClass};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 300;
const DEFAULT_MULTIPLIER: u32 = 2;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Backoff configuration for one call site.
///
/// A policy is plain data; every [`with_retry`] call runs its own backoff
/// sequence, so the same policy can be shared by concurrent callers.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay_ms: u64,
    multiplier: u32,
    max_delay_ms: u64,
    retryable: fn(ErrorClass) -> bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, multiplier: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            multiplier: multiplier.max(1),
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            retryable: ErrorClass::is_retryable,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(0, 0, 1)
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_predicate(mut self, retryable: fn(ErrorClass) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts including the initial one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        (self.retryable)(class)
    }

    /// Delay after the failed attempt number `attempt` (1-based):
    /// `base * multiplier^(attempt - 1)`, capped at the max delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        let calculated = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }

    /// Sum of every backoff delay a fully exhausted call waits through.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_retries)
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }

    fn should_retry(&self, error: &ClassifiedError, attempt: u32) -> bool {
        attempt < self.max_attempts() && self.is_retryable(error.class)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY_MS, DEFAULT_MULTIPLIER)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable class, or the
/// policy's attempts are exhausted. The last error is returned unchanged.
///
/// `operation` receives the 1-based attempt number. Attempts are strictly
/// sequential.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ClassifiedError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClassifiedError>>,
{
    let mut attempt: u32 = 1;
    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !policy.should_retry(&error, attempt) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt,
            max_attempts = policy.max_attempts(),
            class = error.class.code(),
            delay_ms = delay.as_millis() as u64,
            "call failed, retrying after backoff: {}",
            error.message
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
