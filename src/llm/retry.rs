//! Exponential backoff with jitter for transient backend failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::BatchConfig;
use crate::error::PipelineError;
use crate::pipeline::types::millis;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.backoff_base,
            max: config.backoff_max,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max`, plus up to 25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max);
        let jitter_ms = millis(exp) / 4;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Returns the result and the number of retries used.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> (Result<T, PipelineError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = millis(delay),
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let p = RetryPolicy {
            max_retries: 5,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
        };
        let d0 = p.delay(0);
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(125));
        let d2 = p.delay(2);
        assert!(d2 >= Duration::from_millis(400) && d2 <= Duration::from_millis(500));
        let d10 = p.delay(10);
        assert!(d10 >= Duration::from_millis(1000) && d10 <= Duration::from_millis(1250));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let (result, retries) = policy(3)
            .run("test", move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PipelineError::TransientBackend("503".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let (result, retries): (Result<(), _>, _) = policy(2)
            .run("test", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::TransientBackend("down".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let (result, retries): (Result<(), _>, _) = policy(5)
            .run("test", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::Backend("401".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Backend(_))));
        assert_eq!(retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
