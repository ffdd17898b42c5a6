//! Exponential backoff retry for tool calls and tasks

use std::fmt::Display;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Last error after the final allowed attempt, or a non-retryable one
    Failed { attempts: u32, error: E },
    Cancelled,
}

/// Run `operation` until it succeeds, fails permanently, or the policy is spent.
///
/// `operation` receives the 0-based attempt number. Backoff sleeps and
/// in-flight attempts are abandoned as soon as `cancel` fires.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = operation(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= policy.max_retries || !is_retryable(&error) {
            return Err(RetryError::Failed {
                attempts: attempt + 1,
                error,
            });
        }

        let delay = policy.backoff(attempt);
        warn!(
            operation = label,
            attempt = attempt + 1,
            max = policy.max_retries,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after failure"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
