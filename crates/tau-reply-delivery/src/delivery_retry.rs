//! Bounded retry executor with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

const DEFAULT_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_MIN_DELAY_MS: u64 = 400;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.1;

/// Backoff parameters for [`retry_async`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Fraction in `0.0..=1.0`; the delay is scaled by a random factor in `1 ± jitter`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            min_delay_ms: DEFAULT_RETRY_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            factor: DEFAULT_RETRY_FACTOR,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Policy that performs exactly one attempt.
    pub fn single_attempt() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.attempts.max(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.attempts == 0 {
            return Err("retry attempts must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.min_delay_ms {
            return Err(format!(
                "retry max_delay_ms ({}) must be >= min_delay_ms ({})",
                self.max_delay_ms, self.min_delay_ms
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err("retry factor must be a finite number >= 1.0".to_string());
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err("retry jitter must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }
}

/// Observation emitted before each retry sleep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    pub label: String,
    /// Attempt that just failed (1-based).
    pub attempt: usize,
    pub max_attempts: usize,
    pub delay: Duration,
    pub reason: String,
}

/// Computes the delay after `attempt` failed.
///
/// `unit_random` is a sample from `0.0..=1.0`; `0.5` yields the un-jittered delay.
pub fn compute_backoff_delay(
    policy: &RetryPolicy,
    attempt: usize,
    unit_random: f64,
    retry_after: Option<Duration>,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let base_ms = policy.min_delay_ms as f64 * policy.factor.max(1.0).powi(exponent);
    let max_ms = policy.max_delay_ms.max(policy.min_delay_ms) as f64;
    let capped_ms = base_ms.min(max_ms);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let scale = 1.0 + jitter * (unit_random.clamp(0.0, 1.0) * 2.0 - 1.0);
    let mut delay_ms = (capped_ms * scale).clamp(0.0, max_ms);
    if let Some(retry_after) = retry_after {
        delay_ms = delay_ms.max(retry_after.as_millis() as f64).min(max_ms);
    }
    Duration::from_millis(delay_ms.round() as u64)
}

/// Runs `operation` until it succeeds, `should_retry` declines, or the policy
/// runs out of attempts. The last error is returned unchanged.
pub async fn retry_async<T, E, Op, Fut, Retry, Hint, Observe>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: Op,
    should_retry: Retry,
    retry_after_hint: Hint,
    mut on_retry: Observe,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    Retry: Fn(&E, usize) -> bool,
    Hint: Fn(&E) -> Option<Duration>,
    Observe: FnMut(&RetryAttempt, &E),
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1_usize;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error, attempt) {
                    return Err(error);
                }
                let unit_random = rand::thread_rng().gen_range(0.0..=1.0);
                let delay =
                    compute_backoff_delay(policy, attempt, unit_random, retry_after_hint(&error));
                let observation = RetryAttempt {
                    label: label.to_string(),
                    attempt,
                    max_attempts,
                    delay,
                    reason: error.to_string(),
                };
                tracing::debug!(
                    label = label,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason = %observation.reason,
                    "retrying delivery operation"
                );
                on_retry(&observation, &error);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
