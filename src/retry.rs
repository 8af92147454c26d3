//! Retry logic with exponential backoff
//!
//! This module provides configurable retry logic for transient failures.
//! It implements exponential backoff with a delay cap and optional jitter to
//! prevent thundering herd.
//!
//! Errors carry one of three dispositions: transient errors are retried up to
//! the configured budget, stall timeouts get exactly one extra attempt, and
//! everything else fails immediately.
//!
//! # Example
//!
//! ```no_run
//! use manuscript_dl::retry::{Retryable, RetryDisposition, fetch_with_retry};
//! use manuscript_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl Retryable for MyError {
//!     fn retry_disposition(&self) -> RetryDisposition {
//!         match self {
//!             MyError::Transient => RetryDisposition::Retry,
//!             MyError::Permanent => RetryDisposition::Fatal,
//!         }
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let result = fetch_with_retry(&config, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// How a failed operation should be handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Transient failure: retry with backoff up to the configured budget
    Retry,
    /// Stall timeout: retry exactly once, regardless of the transient budget
    RetryOnce,
    /// Permanent failure: fail immediately
    Fatal,
}

/// Trait for errors that can be classified by retry disposition
///
/// Transient failures (server busy, connection reset, request timeout) should
/// return [`RetryDisposition::Retry`]. Stall timeouts, where the server
/// accepted the request but the body dried up, get one extra chance.
/// Permanent failures (rejections, malformed data, invariant violations)
/// return [`RetryDisposition::Fatal`].
pub trait Retryable {
    /// Classify this error for the retry loop
    fn retry_disposition(&self) -> RetryDisposition;
}

impl Retryable for Error {
    fn retry_disposition(&self) -> RetryDisposition {
        match self {
            // Transport errors are retryable when they look transient
            Error::Network(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    RetryDisposition::Retry
                } else {
                    RetryDisposition::Fatal
                }
            }
            // Throttling and 5xx responses clear up on their own
            Error::ServerBusy { .. } => RetryDisposition::Retry,
            // A stalled transfer gets one more chance, then counts as fatal
            Error::TimeoutStalled { .. } => RetryDisposition::RetryOnce,
            // I/O errors can be retryable in some cases
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted => RetryDisposition::Retry,
                _ => RetryDisposition::Fatal,
            },
            // 4xx rejections don't improve with repetition
            Error::ServerRejected { .. } => RetryDisposition::Fatal,
            // Bad payloads come back bad every time
            Error::MalformedResponse { .. } => RetryDisposition::Fatal,
            Error::TileAssembly { .. } => RetryDisposition::Fatal,
            // Invariant violations and config errors are programmer/user errors
            Error::PlanInvariant(_) => RetryDisposition::Fatal,
            Error::Config { .. } => RetryDisposition::Fatal,
            Error::EmptyManifest { .. } => RetryDisposition::Fatal,
            Error::Resolver(_) => RetryDisposition::Fatal,
            // Cache errors are handled by degrading to a miss, not by retrying
            Error::Cache(_) | Error::Sqlx(_) => RetryDisposition::Fatal,
            Error::Image(_) => RetryDisposition::Fatal,
            Error::Serialization(_) => RetryDisposition::Fatal,
            // Cancellation must stop the retry loop immediately
            Error::Cancelled => RetryDisposition::Fatal,
            Error::Other(_) => RetryDisposition::Fatal,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Transient failures are retried up to `config.max_attempts` times. A
/// [`RetryDisposition::RetryOnce`] failure (stall timeout) is granted one
/// extra attempt on top of the transient budget; a second one is fatal.
///
/// # Arguments
///
/// * `config` - Retry configuration (max attempts, delays, backoff multiplier, jitter)
/// * `operation` - Async closure that returns Result<T, E> where E implements Retryable
///
/// # Returns
///
/// Returns the successful result or the last error after the retry budget is
/// exhausted.
pub async fn fetch_with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut stall_retry_used = false;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 || stall_retry_used {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                let disposition = e.retry_disposition();
                let may_retry = match disposition {
                    RetryDisposition::Retry => attempt < config.max_attempts,
                    RetryDisposition::RetryOnce => !stall_retry_used,
                    RetryDisposition::Fatal => false,
                };

                if !may_retry {
                    if disposition == RetryDisposition::Fatal {
                        tracing::error!(error = %e, "Operation failed with non-retryable error");
                    } else {
                        tracing::error!(
                            error = %e,
                            attempts = attempt + 1,
                            "Operation failed after all retry attempts exhausted"
                        );
                    }
                    return Err(e);
                }

                match disposition {
                    RetryDisposition::RetryOnce => stall_retry_used = true,
                    _ => attempt += 1,
                }

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter { add_jitter(delay) } else { delay };

                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
        }
    }
}

/// Backoff delay for the given retry number, capped at `max_delay`
///
/// `retry` counts from 0: the first retry waits `initial_delay`, each
/// subsequent retry multiplies by `backoff_multiplier`.
pub(crate) fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let factor = config.backoff_multiplier.powi(retry.min(63) as i32);
    let delay = Duration::from_secs_f64(config.initial_delay.as_secs_f64() * factor);
    delay.min(config.max_delay)
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
pub(crate) fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
