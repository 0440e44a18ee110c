//! Retry/backoff controller for failed tasks

use crate::envelope::TaskEnvelope;
use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy
///
/// `delay(n) = base_delay * multiplier^(n-1)`, clamped to `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Ceiling for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor between attempts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff (doubling)
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Create a retry policy with fixed delay
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Create a policy that retries immediately
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Calculate the delay imposed after the given (1-based) attempt failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }

    /// Decide what happens to an envelope whose latest attempt failed with `error`
    pub fn decide(&self, envelope: &TaskEnvelope, error: &BusError) -> RetryDecision {
        if error.is_permanent() {
            return RetryDecision::DeadLetter {
                reason: format!("permanent failure: {}", error),
            };
        }

        if envelope.attempt < envelope.max_attempts {
            RetryDecision::Retry {
                delay: self.delay_for_attempt(envelope.attempt),
            }
        } else {
            RetryDecision::DeadLetter {
                reason: format!(
                    "attempts exhausted ({}/{}): {}",
                    envelope.attempt, envelope.max_attempts, error
                ),
            }
        }
    }
}

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Release back to pending, eligible after `delay`
    Retry { delay: Duration },
    /// Terminal; hand off to the dead-letter handler
    DeadLetter { reason: String },
}
