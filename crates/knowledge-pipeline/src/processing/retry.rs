//! Exponential-backoff retry for backend calls

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{Error, Result};

/// Retry policy shared by backend clients
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `operation`, retrying transient failures with exponential backoff
    pub async fn run<F, Fut, T>(&self, label: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < self.max_retries && is_transient(&e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        label,
                        attempt + 1,
                        self.max_retries + 1,
                        delay,
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Transport-level failures are worth another attempt; a service answering with an error
/// code is not.
pub fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Http(_) | Error::Io(_) | Error::Embedding(_))
}
