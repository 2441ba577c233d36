//! Retry with exponential backoff and bounded jitter.
//!
//! Wraps a fallible async operation and re-runs it on failure, sleeping
//! `min(cap, base * 2^attempt) * (1 + U(-jitter, +jitter))` between
//! attempts. After the final attempt the last error is handed back to the
//! caller, who decides what failure means (dead-letter, fatal, ignore).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Backoff policy for [`with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts before giving up.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the un-jittered delay.
    pub cap: Duration,
    /// Jitter as a fraction of the delay; 0.3 means +/-30%.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// Compute the jittered delay after the given 0-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(32);
        let exponential = self.base.as_millis().saturating_mul(1u128 << shift);
        let capped = exponential.min(self.cap.as_millis()) as f64;

        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor)
        } else {
            0.0
        };

        Duration::from_millis((capped * (1.0 + jitter)).max(0.0) as u64)
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation eventually succeeded.
    Success {
        value: T,
        /// Number of attempts it took, counting the successful one.
        attempts: u32,
    },
    /// Every attempt failed; `error` is from the last one.
    Exhausted { error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of attempts performed.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Run `op` until it succeeds or `config.max_retries` attempts are spent.
///
/// `name` labels the operation in logs; every failed attempt is logged at
/// warn with the attempt number and the backoff chosen.
pub async fn with_retry<T, E, F, Fut>(name: &str, config: &RetryConfig, mut op: F) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt,
                };
            }
            Err(error) => {
                if attempt >= config.max_retries.max(1) {
                    warn!(
                        op = name,
                        attempts = attempt,
                        error = %error,
                        "operation failed, retries exhausted"
                    );
                    return RetryOutcome::Exhausted {
                        error,
                        attempts: attempt,
                    };
                }

                let delay = config.delay_for(attempt - 1);
                warn!(
                    op = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
