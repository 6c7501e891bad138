//! Retry and backoff logic for snapvault remote storage adapters
//!
//! Remote listing, existence probes, uploads and deletes are the only places in
//! snapvault that talk to the network. They all go through [`with_backoff`] so
//! a flaky object store is retried with the same exponential schedule no matter
//! which adapter issued the request.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Boxed error carried by retry outcomes
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome classification for a single attempt
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded maximum retry attempts ({attempts}): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: BoxError,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: BoxError,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: BoxError,
    },
}

impl RetryError {
    /// Name of the operation that produced this error
    pub fn operation(&self) -> &'static str {
        match self {
            RetryError::MaxRetriesExceeded { operation, .. }
            | RetryError::Transient { operation, .. }
            | RetryError::Permanent { operation, .. } => operation,
        }
    }

    /// Unwrap the underlying error regardless of classification
    pub fn into_source(self) -> BoxError {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// Backoff schedule plus a hard cap on attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    max_attempts: usize,
}

impl RetryPolicy {
    /// Create a policy from an exponential schedule and an attempt cap
    ///
    /// `max_attempts` counts the first call, so `1` disables retrying.
    pub fn new(backoff: ExponentialBackoff, max_attempts: usize) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Maximum number of attempts, including the first one
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self::new(default_backoff_policy(), 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(default_backoff_policy(), 5)
    }
}

/// Execute an operation with the default retry policy
pub async fn with_backoff<F, T>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    with_policy(op_name, RetryPolicy::default(), f).await
}

/// Execute an operation, retrying transient failures according to `policy`
///
/// The closure receives the 1-based attempt number. Permanent errors are
/// returned immediately; transient errors are retried until the schedule or
/// the attempt cap runs out, at which point the last transient error is
/// wrapped in [`RetryError::MaxRetriesExceeded`].
pub async fn with_policy<F, T>(op_name: &'static str, policy: RetryPolicy, mut f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    let RetryPolicy {
        mut backoff,
        max_attempts,
    } = policy;
    backoff.reset();

    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(operation = op_name, attempt, error = %err, "Operation failed permanently");
                return Err(err);
            }
            Err(err @ RetryError::MaxRetriesExceeded { .. }) => return Err(err),
            Err(RetryError::Transient { source, .. }) => {
                let delay = if attempt < max_attempts {
                    backoff.next_backoff()
                } else {
                    None
                };

                let Some(delay) = delay else {
                    warn!(operation = op_name, attempts = attempt, error = %source, "Retry budget exhausted");
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source,
                    });
                };

                warn!(
                    operation = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(feature = "async-rt")]
async fn sleep(delay: Duration) {
    tokio::time::sleep(delay).await;
}

#[cfg(not(feature = "async-rt"))]
async fn sleep(delay: Duration) {
    std::thread::sleep(delay);
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy for object store requests
pub fn cloud_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .with_multiplier(1.5)
        .build()
}

/// Backoff policy for local storage operations (shorter timeouts)
pub fn local_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(Some(Duration::from_secs(10)))
        .with_multiplier(2.0)
        .build()
}

/// Classifies an error as worth retrying or not
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Wrap the error in the matching [`RetryError`] variant
    fn into_retry_error(self, operation: &'static str) -> RetryError
    where
        Self: std::error::Error + Send + Sync + Sized + 'static,
    {
        if self.is_transient() {
            RetryError::Transient {
                operation,
                source: Box::new(self),
            }
        } else {
            RetryError::Permanent {
                operation,
                source: Box::new(self),
            }
        }
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(1))
            .with_max_interval(Duration::from_millis(2))
            .with_max_elapsed_time(Some(Duration::from_secs(5)))
            .build();
        RetryPolicy::new(backoff, max_attempts)
    }

    fn refused() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result = with_backoff("test_op", |_attempt| Box::pin(async { Ok("success") })).await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_policy("test_op", fast_policy(5), move |_attempt| {
            let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if count < 2 {
                    Err(transient_error!("test_op", refused()))
                } else {
                    Ok("success")
                }
            })
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result: RetryResult<&str> = with_policy("test_op", fast_policy(5), move |_attempt| {
            attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(permanent_error!(
                    "test_op",
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied")
                ))
            })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_cap_reports_last_error() {
        let result: RetryResult<()> = with_policy("list", fast_policy(3), |_attempt| {
            Box::pin(async { Err(transient_error!("list", refused())) })
        })
        .await;

        match result {
            Err(RetryError::MaxRetriesExceeded {
                operation,
                attempts,
                source,
            }) => {
                assert_eq!(operation, "list");
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("connection refused"));
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_retry_policy_runs_once() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result: RetryResult<()> = with_policy("head", RetryPolicy::no_retry(), move |attempt| {
            assert_eq!(attempt, 1);
            attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(transient_error!("head", refused())) })
        })
        .await;

        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded { attempts: 1, .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Error)]
    #[error("status {0}")]
    struct StatusError(u16);

    impl RetryableError for StatusError {
        fn is_transient(&self) -> bool {
            self.0 >= 500
        }
    }

    #[test]
    fn test_retryable_error_classification() {
        assert!(matches!(
            StatusError(503).into_retry_error("put"),
            RetryError::Transient { operation: "put", .. }
        ));
        assert!(matches!(
            StatusError(403).into_retry_error("put"),
            RetryError::Permanent { .. }
        ));
        assert!(StatusError(404).is_permanent());
    }
}
