//! Bounded retries for cloud calls.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use poolscale_core::ServiceConfig;
use poolscale_pool::CloudApiError;

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Per-attempt timeout plus exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_service(service: &ServiceConfig) -> Self {
        Self {
            attempts: service.cloud_retry_attempts.max(1),
            base_delay: service.cloud_retry_base_delay(),
            timeout: service.cloud_timeout(),
        }
    }

    /// Delay before attempt `attempt` (the first retry is attempt 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }

    /// Run `call` until it succeeds or the attempt budget is spent.
    /// Throttling is returned immediately; the next tick retries it.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, CloudApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudApiError>>,
    {
        let mut last_err = CloudApiError::Other(format!("{what}: no attempt made"));
        for attempt in 0..self.attempts.max(1) {
            if attempt > 0 {
                let delay = self.delay(attempt);
                warn!(call = what, attempt, delay = ?delay, error = %last_err, "retrying cloud call");
                tokio::time::sleep(delay).await;
            }
            match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_throttled() => {
                    debug!(call = what, error = %e, "throttled");
                    return Err(e);
                }
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = CloudApiError::Timeout(self.timeout),
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_secs(1));
        assert_eq!(p.delay(3), Duration::from_secs(2));
        assert_eq!(p.delay(20), MAX_DELAY);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("get_status", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CloudApiError::Other("flaky".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(2)
            .run("get_status", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CloudApiError::Other("down".to_string())) }
            })
            .await;
        assert_eq!(result, Err(CloudApiError::Other("down".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn throttling_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .run("modify", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CloudApiError::Throttled("slow down".to_string())) }
            })
            .await;
        assert!(result.unwrap_err().is_throttled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<(), _> = policy(1)
            .run("list", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(CloudApiError::Timeout(Duration::from_millis(200))));
    }
}
