//! Exponential backoff retry strategies with jitter.
//!
//! Decides whether a failed SMS send should be retried and when. The
//! attempt number is the queue's claim count for the job, so a retry that
//! survives a worker crash still counts toward the cap.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Retry policy configuration for provider sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of send attempts (including initial attempt).
    pub max_attempts: u32,

    /// Base delay for exponential backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between retry attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.2,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// Retry decision context for a failed send attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current attempt number (1-based).
    pub attempt_number: u32,
    /// Error that caused the failure.
    pub error: PipelineError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the send at the specified time.
    Retry {
        /// When the next attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry; the send permanently failed.
    GiveUp {
        /// Reason why the send should not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed send.
    pub fn new(
        attempt_number: u32,
        error: PipelineError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry based on the failure context.
    ///
    /// Honors a provider retry-after hint and never retries errors that are
    /// not retryable.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }

    /// Calculates the delay until the next retry attempt.
    pub fn calculate_delay(&self) -> Duration {
        if let Some(retry_after_seconds) = self.error.retry_after_seconds() {
            return Duration::from_secs(retry_after_seconds);
        }

        let base_delay = match self.policy.backoff_strategy {
            BackoffStrategy::Fixed => self.policy.base_delay,
            BackoffStrategy::Linear => {
                self.policy.base_delay * self.attempt_number.saturating_sub(1)
            },
            BackoffStrategy::Exponential => {
                let exponent = self.attempt_number.saturating_sub(1).min(20);
                let multiplier = 2_u32.saturating_pow(exponent);
                self.policy.base_delay.saturating_mul(multiplier)
            },
        };

        let capped_delay = std::cmp::min(base_delay, self.policy.max_delay);

        let jittered_delay = apply_jitter(capped_delay, self.policy.jitter_factor);

        std::cmp::min(jittered_delay, self.policy.max_delay)
    }
}

/// Randomizes the delay by ±jitter_factor.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..Default::default() }
    }

    #[test]
    fn exponential_backoff_increases_correctly() {
        let base_time = Utc::now();

        let delays = (1..=4)
            .map(|attempt| {
                RetryContext::new(attempt, PipelineError::timeout(10), base_time, no_jitter())
                    .calculate_delay()
            })
            .collect::<Vec<_>>();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(12),
                Duration::from_secs(24)
            ]
        );
    }

    #[test]
    fn retry_respects_maximum_attempts() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        let context = RetryContext::new(3, PipelineError::timeout(10), Utc::now(), policy);

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("should not retry at max attempts"),
        }
    }

    #[test]
    fn permanent_rejections_are_not_retried() {
        let context = RetryContext::new(
            1,
            PipelineError::rejected("INVALID_NUMBER", false),
            Utc::now(),
            RetryPolicy::default(),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("should not retry a 4xx"),
        }
    }

    #[test]
    fn retry_after_hint_respected() {
        let failed_at = Utc::now();
        let context = RetryContext::new(
            1,
            PipelineError::rate_limited(45),
            failed_at,
            RetryPolicy::default(),
        );

        assert_eq!(
            context.decide_retry(),
            RetryDecision::Retry { next_attempt_at: failed_at + chrono::Duration::seconds(45) }
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base_delay = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base_delay, 0.5);
            seen.insert(jittered.as_millis());
            assert!(jittered >= Duration::from_secs(5));
            assert!(jittered <= Duration::from_secs(15));
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }

    #[test]
    fn max_delay_enforced() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(60), ..no_jitter() };
        let context = RetryContext::new(4, PipelineError::timeout(10), Utc::now(), policy);
        assert_eq!(context.calculate_delay(), Duration::from_secs(24));

        let policy = RetryPolicy {
            max_attempts: 30,
            max_delay: Duration::from_secs(60),
            ..no_jitter()
        };
        let context = RetryContext::new(25, PipelineError::timeout(10), Utc::now(), policy);
        assert_eq!(context.calculate_delay(), Duration::from_secs(60));
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = RetryPolicy {
            backoff_strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_secs(5),
            ..no_jitter()
        };
        let fixed = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..linear.clone() };

        let linear_delay =
            RetryContext::new(3, PipelineError::timeout(10), Utc::now(), linear).calculate_delay();
        let fixed_delay =
            RetryContext::new(3, PipelineError::timeout(10), Utc::now(), fixed).calculate_delay();

        assert_eq!(linear_delay, Duration::from_secs(10));
        assert_eq!(fixed_delay, Duration::from_secs(5));
    }
}
