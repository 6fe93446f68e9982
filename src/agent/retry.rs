//! Retry policies for model requests
//!
//! Unary requests and stream openings go through [`retry_with_backoff`]:
//! exponential backoff with jitter for 429 and 5xx failures, and a one-time
//! model fallback once rate limiting outlasts the attempt budget. Streams
//! that drain invalid are re-attempted separately under a linear
//! [`StreamRetryPolicy`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::config::{RetrySettings, StreamRetrySettings};
use crate::core::{GantryError, Result};

/// Exponential backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            jitter: 0.3,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * 2f64.powi(attempt.saturating_sub(1).min(31) as i32);
        let clamped = base.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let range = clamped * self.jitter;
            (clamped + rand::random::<f64>() * range * 2.0 - range).max(0.0)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            settings.initial_delay(),
            settings.max_delay(),
        )
    }
}

/// Linear backoff for re-attempting a stream that drained invalid
#[derive(Debug, Clone)]
pub struct StreamRetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl StreamRetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay * attempt
    }
}

impl Default for StreamRetryPolicy {
    fn default() -> Self {
        Self::from(&StreamRetrySettings::default())
    }
}

impl From<&StreamRetrySettings> for StreamRetryPolicy {
    fn from(settings: &StreamRetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
        }
    }
}

/// Asked whether to switch to a cheaper model after persistent rate limiting.
///
/// Returns the accepted model id, or `None` to decline.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(
        &self,
        current_model: &str,
        fallback_model: &str,
        error: &GantryError,
    ) -> Option<String>;
}

/// Fallback handler that always accepts the offered model
pub struct AcceptFallback;

#[async_trait]
impl FallbackHandler for AcceptFallback {
    async fn handle(&self, _current: &str, fallback_model: &str, _error: &GantryError) -> Option<String> {
        Some(fallback_model.to_string())
    }
}

/// Hook run when the attempt budget is exhausted while still rate limited
#[async_trait]
pub trait RateLimitFallback: Send + Sync {
    /// Returns true when the session switched model and one more attempt is due
    async fn on_persistent_rate_limit(&self, error: &GantryError) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// The last error is returned on exhaustion. A server-provided retry delay
/// takes precedence over the computed backoff.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    fallback: Option<&dyn RateLimitFallback>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut fell_back = false;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(error);
        }

        if attempt >= policy.max_attempts {
            if error.is_rate_limited() && !fell_back {
                if let Some(fallback) = fallback {
                    if fallback.on_persistent_rate_limit(&error).await {
                        fell_back = true;
                        attempt = policy.max_attempts - 1;
                        continue;
                    }
                }
            }
            tracing::warn!(attempts = attempt, error = %error, "retry budget exhausted");
            return Err(error);
        }

        let delay = error
            .retry_after()
            .unwrap_or_else(|| policy.delay_for(attempt));
        tracing::warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "request failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.0)
    }

    struct Switch(AtomicBool);

    #[async_trait]
    impl RateLimitFallback for Switch {
        async fn on_persistent_rate_limit(&self, _error: &GantryError) -> bool {
            !self.0.swap(true, Ordering::SeqCst)
        }
    }

    #[test]
    fn test_exponential_delays() {
        let policy = policy(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_secs(30));
        for _ in 0..50 {
            let delay = policy.delay_for(1).as_millis();
            assert!((700..=1300).contains(&delay));
        }
    }

    #[test]
    fn test_stream_policy_is_linear() {
        let policy = StreamRetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_server_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_with_backoff(&policy(3), None, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GantryError::api(503, "unavailable"))
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff(&policy(5), None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GantryError::api(400, "bad request"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff(&policy(3), None, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(GantryError::api(500, format!("failure {}", n)))
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "failure 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_rate_limit_falls_back_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let switch = Switch(AtomicBool::new(false));
        let result: Result<()> = retry_with_backoff(&policy(2), Some(&switch as &dyn RateLimitFallback), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GantryError::api(429, "quota"))
        })
        .await;
        assert!(result.unwrap_err().is_rate_limited());
        // two attempts, the fallback attempt, and no second fallback
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(switch.0.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honored() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = tokio::time::Instant::now();
        let result = retry_with_backoff(&policy(2), None, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GantryError::Api {
                    status: Some(429),
                    message: "slow down".into(),
                    retry_after: Some(Duration::from_secs(7)),
                })
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(7));
    }
}
