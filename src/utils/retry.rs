//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Only startup connects
//! back off; the client and server read loops retry with a fixed delay.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::error::TransportError;

/// Backoff for store connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Determines if a connect error is worth retrying.
///
/// Retryable: the store could not be reached (`Connection`, `Redis`).
///
/// Non-retryable: configuration and group errors, which fail the same way
/// on every attempt.
pub fn is_retryable(err: &TransportError) -> bool {
    err.is_connection_failure()
}
