//! Retry policy: backoff computation and retry eligibility.
//!
//! A [`RetryPolicy`] is a pure value object. `calculate_backoff` has no side
//! effects beyond drawing from the supplied random source, so a seeded RNG
//! makes every schedule reproducible.
//!
//! # Backoff Schedule (default policy, no jitter shown)
//!
//! ```text
//! Attempt  Delay
//! -------  -----
//! 1        1s
//! 2        2s
//! 3        4s
//! ...      capped at max_delay (60s)
//! ```

use crate::error::{CoordinationError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant `base_delay`.
    Fixed,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * multiplier^(attempt-1)`.
    Exponential,
    /// Exponential, then ± `jitter_factor` of itself drawn uniformly.
    ExponentialJitter,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Fixed => write!(f, "fixed"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
            BackoffStrategy::ExponentialJitter => write!(f, "exponential_jitter"),
        }
    }
}

/// Backoff configuration for reliable delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first send.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Ceiling applied after the strategy (and jitter).
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    pub multiplier: f64,
    /// Fraction of the exponential delay used as jitter amplitude.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            strategy: BackoffStrategy::ExponentialJitter,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Fast retries for latency-sensitive traffic.
    ///
    /// 5 attempts, 100ms base, 1.5x growth, capped at 5s.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            strategy: BackoffStrategy::ExponentialJitter,
            multiplier: 1.5,
            ..Default::default()
        }
    }

    /// Slow retries that give the peer time to recover.
    ///
    /// 3 attempts, 2s base, 3x growth, capped at 2 minutes.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 120_000,
            strategy: BackoffStrategy::ExponentialJitter,
            multiplier: 3.0,
            ..Default::default()
        }
    }

    /// Constant delay between attempts.
    pub fn fixed_delay(delay: Duration, max_attempts: u32) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            strategy: BackoffStrategy::Fixed,
            ..Default::default()
        }
    }

    /// Single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff before retrying after `attempt` (1-based), using the thread RNG.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        self.calculate_backoff_with(attempt, &mut rand::rng())
    }

    /// Backoff before retrying after `attempt` (1-based).
    ///
    /// Returns zero for attempt 0. The result is always within
    /// `[0, max_delay]`.
    pub fn calculate_backoff_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay_ms as f64;
        let exponential = || {
            let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
            base * self.multiplier.powi(exp)
        };

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * f64::from(attempt),
            BackoffStrategy::Exponential => exponential(),
            BackoffStrategy::ExponentialJitter => {
                let delay = exponential();
                let spread = if self.jitter_factor > 0.0 {
                    rng.random_range(-1.0_f64..=1.0)
                } else {
                    0.0
                };
                delay + delay * self.jitter_factor * spread
            }
        };

        let capped = if delay_ms.is_finite() {
            delay_ms.clamp(0.0, self.max_delay_ms as f64)
        } else if delay_ms > 0.0 {
            // Overflowed growth saturates at the ceiling
            self.max_delay_ms as f64
        } else {
            0.0
        };

        Duration::from_nanos((capped * 1_000_000.0).round() as u64)
    }

    /// True iff another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sum of the backoffs for attempts `1..=max_attempts`.
    ///
    /// With jitter this is a sample, not a bound.
    pub fn total_timeout(&self) -> Duration {
        (1..=self.max_attempts).map(|attempt| self.calculate_backoff(attempt)).sum()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CoordinationError::Config(
                "retry policy max_attempts must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CoordinationError::Config(
                "retry policy jitter_factor must be within [0, 1]".into(),
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 0.0 {
            return Err(CoordinationError::Config(
                "retry policy multiplier must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy(attempts={}, strategy={}, base_delay={}ms)",
            self.max_attempts, self.strategy, self.base_delay_ms
        )
    }
}
