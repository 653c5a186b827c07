//! Retry of remote operations after transport failures
//!
//! Only failures where the command may not have reached the remote host are
//! retried; a compiler error is never retried.

use super::types::ExecutorError;
use crate::config::RemoteConfig;
use std::time::Duration;

/// Retry policy for remote operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,

    /// Fixed wait between attempts
    pub backoff: Duration,

    pub retry_on_transport_error: bool,
    pub retry_on_io_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            retry_on_transport_error: true,
            retry_on_io_error: false, // local IO errors are not transient
        }
    }
}

impl RetryPolicy {
    /// No retries (fail fast)
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn from_remote_config(config: &RemoteConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            ..Default::default()
        }
    }

    /// Check if an error should be retried
    #[must_use]
    pub fn should_retry(&self, error: &ExecutorError) -> bool {
        match error {
            ExecutorError::Transport(_) => self.retry_on_transport_error,
            ExecutorError::Io(_) => self.retry_on_io_error,
            ExecutorError::Spawn { .. } | ExecutorError::BackendUnavailable(_) => false,
        }
    }

    /// Wait before attempt number `attempt` (0-indexed)
    #[must_use]
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.backoff
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error or
/// runs out of attempts.
///
/// # Errors
///
/// Returns the last error seen.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ExecutorError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExecutorError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let backoff = policy.backoff_duration(attempt);
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        "'{}' succeeded on attempt {}/{}",
                        operation_name,
                        attempt + 1,
                        attempts
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                attempt += 1;
                if !policy.should_retry(&error) {
                    tracing::warn!("'{}' failed with non-retryable error: {}", operation_name, error);
                    return Err(error);
                }
                if attempt >= attempts {
                    tracing::error!(
                        "'{}' failed after {} attempts: {}",
                        operation_name,
                        attempts,
                        error
                    );
                    return Err(error);
                }
                tracing::warn!(
                    "'{}' failed, retrying in {:?} (attempt {}/{}): {}",
                    operation_name,
                    policy.backoff,
                    attempt + 1,
                    attempts,
                    error
                );
            }
        }
    }
}

/// Synchronous version of [`execute_with_retry`]
///
/// # Errors
///
/// Returns the last error seen.
pub fn execute_with_retry_sync<T, F>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ExecutorError>
where
    F: FnMut() -> Result<T, ExecutorError>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let backoff = policy.backoff_duration(attempt);
        if !backoff.is_zero() {
            std::thread::sleep(backoff);
        }

        match operation() {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if !policy.should_retry(&error) || attempt >= attempts {
                    tracing::warn!(
                        "'{}' failed on attempt {}/{}: {}",
                        operation_name,
                        attempt,
                        attempts,
                        error
                    );
                    return Err(error);
                }
                tracing::debug!("'{}' failed, retrying: {}", operation_name, error);
            }
        }
    }
}
