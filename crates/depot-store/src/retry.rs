//! Retry policy for transient connection failures.
//!
//! A co-located store server can restart or briefly refuse connections while
//! the client keeps issuing requests, so transient connectivity errors are
//! retried until the transport recovers. The retry is an explicit loop, not
//! recursion, and each attempt must re-acquire its own limiter slot inside
//! `operation` so retries stay rate-limited.

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the transient-failure retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: crate::config::ProtocolConfig::RETRY_DELAY,
        }
    }
}

impl RetryConfig {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

/// Run `operation`, retrying indefinitely while it fails with a transient
/// connectivity error. Any other error propagates immediately.
///
/// There is no attempt cap and no exponential backoff: the channel is a
/// trusted local one, and the caller decides when to give up by dropping the
/// future.
pub async fn retry_transient<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u64 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("operation succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt == 1 || attempt % 50 == 0 {
                    warn!("transient connection failure (attempt {}): {}", attempt, e);
                }
                tokio::time::sleep(config.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DepotError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn refused() -> DepotError {
        DepotError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let config = RetryConfig::new(Duration::from_millis(1));
        let value = retry_transient(&config, || async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let config = RetryConfig::new(Duration::from_millis(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let value = retry_transient(&config, || {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 4 {
                    Err(refused())
                } else {
                    Ok("recovered")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_non_transient_error_propagates_immediately() {
        let config = RetryConfig::new(Duration::from_millis(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry_transient(&config, || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(DepotError::Collaborator {
                    message: "no matching version".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(DepotError::Collaborator { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
