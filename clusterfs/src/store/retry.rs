//! Bounded exponential backoff for transient backend failures.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use super::backend::BackendError;
use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `operation`, retrying only `Unavailable` failures. Conflicts and
    /// other errors are returned on the first occurrence.
    pub async fn run<T, F, Fut>(&self, operation_name: &'static str, operation: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(BackendError::Unavailable(message)) => {
                    if attempt > self.max_retries {
                        return Err(StoreError::Unavailable {
                            attempts: attempt,
                            message: format!("{operation_name}: {message}"),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(operation = operation_name, attempt, ?delay, "transient failure: {message}");
                    sleep(delay).await;
                }
                Err(BackendError::ConditionFailed) => return Err(StoreError::Conflict),
                Err(BackendError::Other(message)) => {
                    return Err(StoreError::Backend(format!("{operation_name}: {message}")));
                }
            }
        }
    }
}
