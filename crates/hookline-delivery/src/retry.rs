//! Exponential backoff with bounded jitter.
//!
//! The delay curve is a pure function of the attempt count and the policy;
//! randomness enters only through [`apply_jitter`], which takes its RNG as an
//! argument so tests can make it deterministic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hookline_core::time::saturating_add;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for failed handler invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first) before the record is
    /// dead-lettered.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,

    /// Jitter as a fraction of the delay (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

/// What the scheduler should do with a failed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the record to `Pending`, due at `next_attempt_at`.
    Retry {
        /// When the next attempt may start
        next_attempt_at: DateTime<Utc>,
    },
    /// Retries are exhausted; dead-letter the record.
    GiveUp {
        /// Attempts recorded so far
        attempts: u32,
    },
}

impl RetryPolicy {
    /// Decides the fate of a record that has just recorded its
    /// `attempt_count`-th failed attempt.
    pub fn decide(&self, attempt_count: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp { attempts: attempt_count };
        }

        let delay = self.next_delay(attempt_count.saturating_sub(1), &mut rand::rng());
        RetryDecision::Retry { next_attempt_at: saturating_add(now, delay) }
    }

    /// Backoff after `prior_attempts` earlier failures, jittered and capped.
    pub fn next_delay<R: Rng + ?Sized>(&self, prior_attempts: u32, rng: &mut R) -> Duration {
        let delay = backoff_delay(prior_attempts, self.base_delay, self.max_delay);
        apply_jitter(delay, self.jitter_factor, rng).min(self.max_delay)
    }
}

/// `base_delay * 2^n`, capped at `max_delay`.
pub fn backoff_delay(n: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(n.min(31));
    base_delay.saturating_mul(multiplier).min(max_delay)
}

/// Randomizes `duration` by up to `±jitter_factor` of itself.
///
/// With `jitter_factor = 0.25` a 10s delay lands anywhere in 7.5s..=12.5s.
pub fn apply_jitter<R: Rng + ?Sized>(
    duration: Duration,
    jitter_factor: f64,
    rng: &mut R,
) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::try_from_secs_f64(jittered_secs.max(0.0)).unwrap_or(duration)
}
