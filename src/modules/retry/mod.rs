//! Retry orchestration with exponential backoff and jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use super::delay_from_secs;

/// HTTP statuses worth another attempt.
pub const RETRYABLE_STATUS_CODES: [u16; 9] = [429, 500, 502, 503, 504, 521, 522, 523, 524];

/// Relative jitter applied around the computed delay.
const JITTER_RATIO: f64 = 0.1;

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Classification of failures into transient and fatal ones.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Backoff parameters. Delays are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
            multiplier: 1.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn fast() -> Self {
        Self {
            max_attempts: 2,
            base_delay: 0.5,
            max_delay: 10.0,
            ..Self::default()
        }
    }

    pub fn standard() -> Self {
        Self::default()
    }

    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: 2.0,
            max_delay: 120.0,
            exponential_base: 2.5,
            ..Self::default()
        }
    }

    /// Backoff before the retry that follows failed attempt `attempt`
    /// (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay * self.exponential_base.powi(exponent) * self.multiplier;
        let capped = raw.min(self.max_delay);
        if capped.is_nan() {
            Duration::ZERO
        } else {
            delay_from_secs(capped)
        }
    }
}

/// Details handed to the retry hook before the orchestrator sleeps.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// Number of the attempt that just failed.
    pub number: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: &'a E,
}

#[derive(Debug, Clone, Default)]
pub struct RetryOrchestrator {
    config: RetryConfig,
}

impl RetryOrchestrator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the next attempt, jittered by up to ±10 % when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_for(attempt).as_secs_f64();
        if !self.config.jitter || base == 0.0 {
            return delay_from_secs(base);
        }
        let spread = base * JITTER_RATIO;
        let jittered = base + rand::thread_rng().gen_range(-spread..=spread);
        delay_from_secs(jittered)
    }

    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.run_with(op, |_| {}).await
    }

    /// Run `op` until it succeeds, fails fatally, or attempts are exhausted.
    /// `op` receives the 1-based attempt number; `on_retry` is invoked before
    /// every backoff sleep.
    pub async fn run_with<T, E, F, Fut, H>(&self, mut op: F, mut on_retry: H) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        H: FnMut(&RetryAttempt<'_, E>),
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!("succeeded on attempt {attempt}/{max_attempts}");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                log::warn!("fatal error on attempt {attempt}: {error}");
                return Err(error);
            }
            if attempt >= max_attempts {
                log::error!("giving up after {attempt} attempts: {error}");
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            log::warn!(
                "attempt {attempt}/{max_attempts} failed: {error}; retrying in {:.2}s",
                delay.as_secs_f64()
            );
            on_retry(&RetryAttempt {
                number: attempt,
                max_attempts,
                delay,
                error: &error,
            });
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::MAX_DELAY;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;
    use tokio::time::Instant;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let config = RetryConfig {
            max_delay: 5.0,
            ..RetryConfig::default()
        };
        assert_eq!(config.base_delay_for(1), Duration::from_secs(1));
        assert_eq!(config.base_delay_for(2), Duration::from_secs(2));
        assert_eq!(config.base_delay_for(3), Duration::from_secs(4));
        assert_eq!(config.base_delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn huge_delays_saturate() {
        let config = RetryConfig {
            base_delay: 1e30,
            max_delay: 1e30,
            ..RetryConfig::default()
        };
        assert_eq!(config.base_delay_for(1), MAX_DELAY);
        assert_eq!(config.base_delay_for(40), MAX_DELAY);

        let orchestrator = RetryOrchestrator::new(config);
        assert!(orchestrator.delay_for(3) <= MAX_DELAY);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let orchestrator = RetryOrchestrator::new(RetryConfig::default());
        for _ in 0..200 {
            let delay = orchestrator.delay_for(2).as_secs_f64();
            assert!((1.8..=2.2).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(522));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(403));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_exactly_max_attempts() {
        let orchestrator = RetryOrchestrator::new(RetryConfig::default());
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), TestError> = orchestrator
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Transient) }
            })
            .await;

        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let waited = started.elapsed().as_secs_f64();
        assert!((2.7..=3.3).contains(&waited), "waited {waited}");
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let orchestrator = RetryOrchestrator::new(RetryConfig::default());
        let calls = AtomicU32::new(0);

        let result: Result<(), TestError> = orchestrator
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            })
            .await;

        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hook_sees_each_retry_and_success_stops_the_loop() {
        let orchestrator = RetryOrchestrator::new(RetryConfig {
            max_attempts: 5,
            jitter: false,
            ..RetryConfig::default()
        });
        let mut seen = Vec::new();

        let result = orchestrator
            .run_with(
                |attempt| async move {
                    if attempt < 3 {
                        Err(TestError::Transient)
                    } else {
                        Ok(attempt)
                    }
                },
                |retry| seen.push((retry.number, retry.delay)),
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            seen,
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }
}
