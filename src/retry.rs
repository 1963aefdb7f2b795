//! Bounded retry policies for activity invocations.
//!
//! Policies are applied on the worker dispatch path: backoff sleeps block only
//! the task executing the activity, never orchestration replay. Every activity
//! fault counts as retryable; there is deliberately no transient/permanent
//! classification, so the policy bound is the only thing standing between a
//! failing activity and a `TaskFailed` event.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * multiplier^(attempt-1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Exponential {
                base,
                multiplier,
                max,
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
                let delayed = base.as_secs_f64() * factor;
                if !delayed.is_finite() || delayed >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(delayed)
                }
            }
        }
    }
}

/// Bounded retry: attempt 1 runs immediately; each failure sleeps the backoff
/// delay and retries until `max_attempts` consecutive failures, at which point
/// the last failure's details surface as the task's terminal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            },
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt bound and no backoff.
    ///
    /// Panics if `max_attempts` is zero; a task must run at least once.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            backoff: BackoffStrategy::None,
        }
    }

    /// Fixed-interval policy, the shape used by the quorum workflow.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed { delay },
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}
