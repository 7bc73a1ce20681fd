//! Bounded exponential backoff for store operations.
//!
//! [`RetryPolicy`] is a small state machine: it counts attempts and, for each
//! failure, decides between retrying after a delay, giving up because the cap
//! was reached, or giving up because the failure cannot be fixed by retrying.
//! Classification comes from [`StoreErrorKind::is_transient`](crate::StoreErrorKind::is_transient).
//!
//! The policy never decides to fail open. It only reports exhaustion; what
//! happens next is up to the caller.

use std::{future::Future, time::Duration};

use rand::Rng;

use crate::{AdmissionError, runtime::async_sleep};

/// Retry settings for store operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            exponential_base: 2f64,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Build a validated retry configuration.
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
        jitter: f64,
    ) -> Result<Self, AdmissionError> {
        if !exponential_base.is_finite() || exponential_base < 1f64 {
            return Err(AdmissionError::InvalidConfig(
                "Exponential base must be at least 1".to_string(),
            ));
        }

        if !(0f64..=1f64).contains(&jitter) {
            return Err(AdmissionError::InvalidConfig(
                "Jitter must be between 0 and 1".to_string(),
            ));
        }

        if base_delay > max_delay {
            return Err(AdmissionError::InvalidConfig(
                "Base delay must not exceed max delay".to_string(),
            ));
        }

        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            exponential_base,
            jitter,
        })
    }

    /// A configuration that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;

        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.backoff(attempt).mul_f64(1f64 + self.jitter))
            .sum()
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0f64 || delay.is_zero() {
            return delay;
        }

        let factor = 1f64 + rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0f64))
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    RetryAfter(Duration),
    /// The failure was transient but the retry cap has been reached.
    Exhausted,
    /// The failure cannot be fixed by retrying.
    Fatal,
}

/// Attempt counter for a single operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: u32,
}

impl RetryPolicy {
    /// A fresh policy with no failed attempts.
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts made so far, counting the one that just failed.
    pub fn attempts(&self) -> u32 {
        self.attempt + 1
    }

    /// Record a failure and decide what to do next.
    pub fn on_failure(&mut self, err: &AdmissionError) -> RetryDecision {
        if !err.is_transient() {
            return RetryDecision::Fatal;
        }

        if self.attempt >= self.config.max_retries {
            return RetryDecision::Exhausted;
        }

        let delay = self.config.jittered(self.config.backoff(self.attempt));
        self.attempt += 1;

        RetryDecision::RetryAfter(delay)
    }
}

/// Run `op` until it succeeds, fails fatally, or runs out of retries.
///
/// Transient failures that outlive the retry cap come back as
/// [`AdmissionError::RetriesExhausted`].
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, AdmissionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdmissionError>>,
{
    let mut policy = RetryPolicy::new(*config);

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match policy.on_failure(&err) {
            RetryDecision::RetryAfter(delay) => {
                tracing::debug!(
                    error = %err,
                    attempt = policy.attempts() - 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transient store failure, retrying"
                );
                async_sleep(delay).await;
            }
            RetryDecision::Exhausted => {
                let attempts = policy.attempts();
                return Err(match err {
                    AdmissionError::Store(source) => {
                        AdmissionError::RetriesExhausted { attempts, source }
                    }
                    other => other,
                });
            }
            RetryDecision::Fatal => return Err(err),
        }
    }
}
