//! Retry policy: exponential backoff with a circuit breaker.
//!
//! Every remote read and write goes through [`RetryPolicy::run`]. Retryable
//! failures back off exponentially up to a cap; after a run of consecutive
//! failed operations the breaker opens and calls fail fast until the cooldown
//! elapses, at which point a single probe is let through (half-open).

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Consecutive failed operations before the breaker opens.
    pub circuit_threshold: u32,
    pub circuit_cooldown: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// RetryPolicy
// ============================================================================

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

pub struct RetryPolicy {
    config: RetryConfig,
    breaker: Mutex<BreakerState>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            breaker: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether the breaker is currently rejecting calls.
    pub fn is_open(&self) -> bool {
        let breaker = self.breaker.lock();
        matches!(breaker.open_until, Some(until) if Instant::now() < until)
    }

    /// Forget all failure history.
    pub fn reset(&self) {
        *self.breaker.lock() = BreakerState::default();
    }

    /// Run `op`, retrying retryable errors with exponential backoff.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_breaker()?;

        let mut delay = self.config.initial_delay;
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e,
                        "retrying remote operation");
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, &self.config);
                }
                Err(e) => {
                    self.record_failure();
                    return Err(e);
                }
            }
        }
    }

    /// Reject when open; allow one probe after the cooldown has elapsed.
    fn check_breaker(&self) -> Result<()> {
        let mut breaker = self.breaker.lock();
        if let Some(until) = breaker.open_until {
            if Instant::now() < until {
                return Err(Error::CircuitOpen);
            }
            breaker.open_until = None;
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures = 0;
        breaker.open_until = None;
    }

    fn record_failure(&self) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.config.circuit_threshold {
            breaker.open_until = Some(Instant::now() + self.config.circuit_cooldown);
            warn!(
                failures = breaker.consecutive_failures,
                cooldown_ms = self.config.circuit_cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }
}

fn next_delay(current: Duration, config: &RetryConfig) -> Duration {
    let scaled = current.as_secs_f64() * config.backoff_factor;
    Duration::from_secs_f64(scaled).min(config.max_delay)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
            circuit_threshold: 2,
            circuit_cooldown: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let policy = RetryPolicy::new(fast_config());
        let result = policy.run(|| async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let policy = RetryPolicy::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = policy
            .run(move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::network("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let policy = RetryPolicy::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<()> = policy
            .run(move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network {
                        message: "bad request".into(),
                        retryable: false,
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_fails_fast() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 0,
            ..fast_config()
        });
        for _ in 0..2 {
            let _: Result<()> = policy
                .run(|| async { Err(Error::network("down")) })
                .await;
        }
        assert!(policy.is_open());
        let err = policy
            .run(|| async { Ok::<_, Error>(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen));
    }

    #[tokio::test]
    async fn breaker_half_opens_after_cooldown() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 0,
            ..fast_config()
        });
        for _ in 0..2 {
            let _: Result<()> = policy
                .run(|| async { Err(Error::network("down")) })
                .await;
        }
        assert!(policy.is_open());
        tokio::time::sleep(Duration::from_millis(25)).await;
        // Probe allowed; success closes the breaker.
        let result = policy.run(|| async { Ok::<_, Error>(9) }).await.unwrap();
        assert_eq!(result, 9);
        assert!(!policy.is_open());
    }

    #[tokio::test]
    async fn reset_clears_failure_history() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 0,
            ..fast_config()
        });
        for _ in 0..2 {
            let _: Result<()> = policy
                .run(|| async { Err(Error::network("down")) })
                .await;
        }
        assert!(policy.is_open());
        policy.reset();
        assert!(!policy.is_open());
    }
}
