//! Retry logic with exponential backoff
//!
//! Both manifest resolution and segment fetches run through [`with_retry`].
//! Delays grow exponentially up to `max_delay`, with optional jitter so that
//! parallel segment workers do not hammer the CDN in lockstep.
//!
//! # Example
//!
//! ```no_run
//! use tidal_dl::retry::{IsRetryable, with_retry};
//! use tidal_dl::config::RetryConfig;
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
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let value = with_retry(&config, || async { Ok::<_, MyError>(7) }, |_, _| {})
//!     .await
//!     .map_err(|exhausted| exhausted.error)?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, 5xx, connection reset) return `true`.
/// Permanent failures (unauthorized, not available, corrupt data) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::TransientService(_) => true,
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_body()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // Stale manifests are handled by re-resolving, not by retrying in place
            Error::FetchExhausted { .. } | Error::IntegrityFailure(_) => false,
            Error::NotAvailable { .. }
            | Error::Unauthorized(_)
            | Error::UnsupportedFormat(_)
            | Error::TranscodeFailure(_)
            | Error::ExternalTool(_)
            | Error::Cancelled
            | Error::ShuttingDown
            | Error::DestinationUnwritable { .. }
            | Error::InvalidManifest(_)
            | Error::InvalidIdentifier(_)
            | Error::Config { .. }
            | Error::NotFound(_)
            | Error::Serialization(_) => false,
        }
    }
}

/// The last error of an operation that did not succeed, with the attempt count
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Error returned by the final attempt
    pub error: E,
    /// Attempts made, including the first
    pub attempts: u32,
}

/// Execute an async operation with exponential backoff retry logic
///
/// `on_retry` is called with the retry number (starting at 1) and the error
/// that triggered it, before the backoff sleep. Dropping the returned future
/// cancels any pending sleep, so callers race it against a cancellation token.
pub async fn with_retry<F, Fut, T, E, R>(
    config: &RetryConfig,
    mut operation: F,
    mut on_retry: R,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
    R: FnMut(u32, &E),
{
    let mut retries = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if retries > 0 {
                    tracing::debug!(attempts = retries + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && retries < config.max_retries => {
                retries += 1;

                tracing::debug!(
                    error = %e,
                    retry = retries,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                on_retry(retries, &e);

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };
                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(
                        error = %e,
                        attempts = retries + 1,
                        "operation failed after all retries"
                    );
                }
                return Err(Exhausted {
                    error: e,
                    attempts: retries + 1,
                });
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result is uniformly distributed between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
