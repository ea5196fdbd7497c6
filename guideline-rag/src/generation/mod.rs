//! Hosted model access and the rate-limit retry policy wrapped around it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::error::GenerationError;

#[cfg(feature = "rig")]
mod openrouter;
mod vertex;

#[cfg(feature = "rig")]
pub use openrouter::RigClient;
pub use vertex::{VertexClient, VertexConfig};

/// One prompt in, the model's raw text out.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Identifier of the hosted model, for logs.
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Bounded exponential backoff applied to rate-limit rejections only.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Scale each delay by a random factor in [0.5, 1.0].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    fn delay(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        base.mul_f64(rand::rng().random_range(0.5..=1.0))
    }
}

/// Decorator that retries rate-limited calls according to a [`RetryPolicy`].
pub struct RetryingClient {
    inner: Arc<dyn GenerationClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn GenerationClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl GenerationClient for RetryingClient {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut retry = 0;
        loop {
            match self.inner.generate(prompt).await {
                Err(e) if e.is_retryable() && retry < self.policy.max_retries => {
                    let delay = self.policy.delay(retry);
                    warn!(
                        model = self.inner.model(),
                        retry = retry + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "rate limited by model provider, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted results, then keeps returning the last one.
    struct Scripted {
        results: Mutex<Vec<Result<String, GenerationError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut results: Vec<Result<String, GenerationError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationClient for Scripted {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.pop().unwrap()
            } else {
                match results.last().unwrap() {
                    Ok(s) => Ok(s.clone()),
                    Err(_) => Err(GenerationError::RateLimited("still limited".into())),
                }
            }
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::default();
        for retry in 0..4 {
            let delay = policy.delay(retry);
            let base = policy.backoff(retry);
            assert!(delay <= base);
            assert!(delay >= base / 2);
        }
    }

    #[tokio::test]
    async fn retries_rate_limits_then_succeeds() {
        let inner = Arc::new(Scripted::new(vec![
            Err(GenerationError::RateLimited("429".into())),
            Err(GenerationError::RateLimited("429".into())),
            Ok("{}".into()),
        ]));
        let client = RetryingClient::new(inner.clone(), fast_policy(3));

        assert_eq!(client.generate("p").await.unwrap(), "{}");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_at_the_retry_ceiling() {
        let inner = Arc::new(Scripted::new(vec![Err(GenerationError::RateLimited(
            "429".into(),
        ))]));
        let client = RetryingClient::new(inner.clone(), fast_policy(2));

        let err = client.generate("p").await.unwrap_err();
        assert!(matches!(err, GenerationError::RateLimited(_)));
        // first attempt plus two retries
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeouts_and_request_failures_are_not_retried() {
        for error in [
            GenerationError::Timeout(Duration::from_secs(30)),
            GenerationError::Request("HTTP 401".into()),
        ] {
            let inner = Arc::new(Scripted::new(vec![Err(error), Ok("unused".into())]));
            let client = RetryingClient::new(inner.clone(), fast_policy(3));

            assert!(client.generate("p").await.is_err());
            assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn no_retry_policy_fails_fast() {
        let inner = Arc::new(Scripted::new(vec![Err(GenerationError::RateLimited(
            "429".into(),
        ))]));
        let client = RetryingClient::new(inner.clone(), RetryPolicy::none());
        assert!(client.generate("p").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.model(), "scripted");
    }
}
