// SPDX-License-Identifier: MIT
//! Exponential backoff retry for operations with transient failure modes.
//!
//! Provides [`retry_with_backoff`] — a generic async helper that retries a
//! fallible operation with exponentially increasing delays, but only while
//! the caller's predicate judges the error transient. Permanent errors are
//! returned immediately, whatever the attempt budget.
//!
//! # Example
//! ```rust,ignore
//! use tenantd::retry::{retry_with_backoff, RetryConfig};
//!
//! let result = retry_with_backoff(
//!     &RetryConfig::default(),
//!     |err| err.is_transient(),
//!     || async { handler.handle(&event).await },
//! )
//! .await;
//! ```

use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    ///
    /// Default: 3
    pub max_attempts: u32,
    /// Delay before the second attempt.
    ///
    /// Each subsequent delay is multiplied by `multiplier`.
    /// Default: 50 ms
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    ///
    /// Default: 2 s
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry.
    ///
    /// Default: 2.0 (doubles each time)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// Create a config with a single attempt (no retries).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Calls `f()` up to `config.max_attempts` times. After a failure that
/// `is_transient` accepts, waits for the computed backoff delay and tries
/// again; the delay starts at `config.initial_delay` and is multiplied by
/// `config.multiplier` after each attempt, capped at `config.max_delay`.
/// A failure `is_transient` rejects ends the loop at once.
///
/// Returns `Ok(result)` on the first success, or the last error seen.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut is_transient: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
    P: FnMut(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(err) if attempt < max_attempts && is_transient(&err) => {
                warn!(
                    attempt,
                    max = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    err = ?err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                // Compute next delay: multiply and cap.
                let next_ms = (delay.as_millis() as f64 * config.multiplier) as u128;
                delay = Duration::from_millis(next_ms.min(config.max_delay.as_millis()) as u64);
            }
            Err(err) => {
                if attempt > 1 {
                    warn!(attempt, err = ?err, "exhausted retry attempts");
                }
                return Err(err);
            }
        }
    }
}
