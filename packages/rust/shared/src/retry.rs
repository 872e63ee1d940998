//! Bounded retry with exponential backoff.
//!
//! Connection-level failures are always retried; HTTP failures only when
//! their status is in the policy's list. Every other error is terminal.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{HarvestError, Result};

/// Statuses retried for idempotent GETs.
pub const SERVER_ERROR_STATUSES: &[u16] = &[500, 502, 503, 504];

/// Statuses retried for uploads (the host rate-limits with 429).
pub const UPLOAD_RETRY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// How many times to try a request and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
    /// HTTP statuses worth another attempt.
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            retry_statuses: SERVER_ERROR_STATUSES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether `error` deserves another attempt.
    pub fn should_retry(&self, error: &HarvestError) -> bool {
        match error {
            HarvestError::Network(_) => true,
            HarvestError::Http { status, .. } => self.retry_statuses.contains(status),
            _ => false,
        }
    }

    /// Delay before retry number `attempt` (0-based): `min(initial * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails terminally, or the budget runs out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !self.should_retry(&e) {
                        return Err(e);
                    }
                    let delay = self.backoff(attempt - 1);
                    warn!(
                        target_label = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
