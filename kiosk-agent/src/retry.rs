//! Bounded exponential backoff
//!
//! Every network call in the agent goes through [`RetryPolicy::run`]. Both the
//! number of attempts and the cumulative sleep are capped, so one stalled
//! cycle cannot hold up the next one indefinitely.

use std::future::Future;
use std::time::Duration;

use kiosk_common::config::SyncConfig;
use kiosk_common::time::millis_to_duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Retry policy for one logical network call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Upper bound for the sum of all delays
    pub max_total_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            max_total_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_download_attempts.max(1),
            base_delay: millis_to_duration(config.backoff_base_ms),
            max_delay: millis_to_duration(config.backoff_max_ms),
            max_total_delay: millis_to_duration(config.backoff_total_cap_ms),
        }
    }

    /// Single attempt, no sleeping
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_total_delay: Duration::ZERO,
        }
    }

    /// Delays slept between attempts, after the cumulative cap is applied
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut total = Duration::ZERO;
        for failure in 0..self.max_attempts.saturating_sub(1) {
            let factor = 1u32.checked_shl(failure).unwrap_or(u32::MAX);
            let delay = self
                .base_delay
                .checked_mul(factor)
                .unwrap_or(self.max_delay)
                .min(self.max_delay);
            let remaining = self.max_total_delay.saturating_sub(total);
            let delay = delay.min(remaining);
            total += delay;
            delays.push(delay);
        }
        delays
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// Only errors for which `is_transient()` holds are retried.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let delays = self.delays();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && (attempt as usize) <= delays.len() => {
                    let delay = delays[attempt as usize - 1];
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(operation = label, attempt, error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}
