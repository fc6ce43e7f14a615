//! Bounded retry with backoff for operations waiting on a remote system.
//!
//! Used around anything whose success depends on something else reaching
//! readiness: the control-plane API answering, a deployment finishing its
//! rollout. Exhaustion is reported as a typed [`RetryError::Exhausted`] so the
//! caller can tell "gave up waiting" apart from the operation's own error.
//!
//! # Example
//!
//! ```ignore
//! use homelab_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let node = retry_with_backoff(
//!     &RetryConfig::fixed(60, Duration::from_secs(5)),
//!     "node_ready",
//!     || async { api.node_ready("pi-node").await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = fixed interval)
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Fixed interval between attempts, no jitter
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Upper bound on total time spent sleeping, `None` when unbounded
    pub fn max_wait(&self) -> Option<Duration> {
        if self.max_attempts == 0 {
            return None;
        }
        let mut delay = self.initial_delay;
        let mut total = Duration::ZERO;
        for _ in 1..self.max_attempts {
            total += delay;
            delay = self.next_delay(delay);
        }
        Some(total)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Failure of a retried operation
#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error seen
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The error from the final attempt
    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Execute an async operation with backoff until it succeeds or the attempt
/// budget is spent.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation still failing after max attempts"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }

                let sleep_for = if config.jitter {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
                } else {
                    delay
                };

                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = sleep_for.as_millis(),
                    "Operation not ready, retrying"
                );

                tokio::time::sleep(sleep_for).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
