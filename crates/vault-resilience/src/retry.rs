//! Bounded exponential-backoff retry
//!
//! A pure combinator: no shared state, composes around any async operation
//! returning [`vault_core::Result`].

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};
use vault_core::config::RetryConfig;
use vault_core::{ErrorKind, Result, VaultError};

/// Retry settings for one call site
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_base: f64,
    /// Error kinds worth another attempt; everything else propagates at once
    pub retryable: Vec<ErrorKind>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_retryable(mut self, kinds: &[ErrorKind]) -> Self {
        self.retryable = kinds.to_vec();
        self
    }

    /// Sleep before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.backoff_base.powi(attempt as i32);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs > cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn is_retryable(&self, error: &VaultError) -> bool {
        self.retryable.contains(&error.kind())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_base: config.backoff_base,
            retryable: vec![ErrorKind::Transient, ErrorKind::Timeout, ErrorKind::Io],
        }
    }
}

/// Run `operation`, retrying retryable failures with exponential backoff.
///
/// Returns the last error once `max_attempts` calls have failed. A
/// non-retryable error is returned immediately without consuming a retry.
///
/// # Usage
///
/// ```no_run
/// use std::time::Duration;
/// use vault_core::Result;
/// use vault_resilience::{with_retry, RetryPolicy};
///
/// async fn send() -> Result<String> {
///     Ok("msg-1".to_string())
/// }
///
/// async fn example() -> Result<()> {
///     let policy = RetryPolicy::new(3, Duration::from_secs(1));
///     let id = with_retry("gmail_send", &policy, || send()).await?;
///     // Delays between attempts: 1s, 2s
///     Ok(())
/// }
/// ```
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) if !policy.is_retryable(&e) => {
                error!("{} failed with non-retryable error: {}", operation_name, e);
                return Err(e);
            }
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    error!(
                        "{} failed after {} attempts: {}",
                        operation_name, max_attempts, e
                    );
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} attempt {}/{} failed, retrying in {:.1}s: {}",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    delay.as_secs_f64(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_base: 2.0,
            retryable: vec![ErrorKind::Transient],
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(60), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_bound() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let mut calls = Vec::new();

        let result = with_retry("always_fails", &policy, || {
            calls.push(Instant::now());
            async { Err::<(), _>(VaultError::Transient("rate limited".into())) }
        })
        .await;

        assert!(matches!(result, Err(VaultError::Transient(_))));
        assert_eq!(calls.len(), 3);

        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
        assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_propagates_immediately() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let mut attempts = 0;

        let result = with_retry("bad_request", &policy, || {
            attempts += 1;
            async { Err::<(), _>(VaultError::Permanent("invalid recipient".into())) }
        })
        .await;

        assert!(matches!(result, Err(VaultError::Permanent(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let mut attempts = 0;

        let result = with_retry("flaky", &policy, || {
            attempts += 1;
            let n = attempts;
            async move {
                if n < 2 {
                    Err(VaultError::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 2);
    }
}
