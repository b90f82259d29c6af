//! Retry scheduling: exponential backoff with jitter, bounded by an attempt
//! count and a total retry window.
//!
//! The two caps are independent; a delivery is dead-lettered by whichever is
//! hit first.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Retry policy for a (subscription, message) delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt (in seconds). Doubles per attempt.
    pub base_delay_secs: i64,

    /// Upper bound for any single delay (in seconds).
    pub max_delay_secs: i64,

    /// Maximum total attempts, including the first.
    pub max_attempts: i32,

    /// Maximum time between the first attempt and any retry (in seconds).
    pub max_window_secs: i64,

    /// Fraction of the computed delay added as uniform random jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            max_delay_secs: 3600,
            max_attempts: 10,
            max_window_secs: 86_400,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt number (2-based: attempt 1 runs
    /// immediately). Jittered, capped at `max_delay_secs`.
    pub fn delay_before(&self, attempt_number: i32) -> Duration {
        let exponent = (attempt_number - 2).clamp(0, 30) as u32;
        let raw_secs = self
            .base_delay_secs
            .saturating_mul(1_i64 << exponent)
            .min(self.max_delay_secs);

        let jitter_max_ms = ((raw_secs * 1000) as f64 * self.jitter_ratio) as i64;
        let jitter_ms = if jitter_max_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_max_ms)
        } else {
            0
        };

        let total_ms = (raw_secs * 1000 + jitter_ms).min(self.max_delay_secs * 1000);
        Duration::milliseconds(total_ms)
    }

    /// Schedule the retry that follows a failed attempt.
    ///
    /// Returns `None` when the retry budget is exhausted, either because the
    /// next attempt would exceed `max_attempts` or because it would land
    /// outside the retry window anchored at `first_attempted_at`.
    pub fn next_retry_at(
        &self,
        failed_attempt_number: i32,
        first_attempted_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let next_attempt = failed_attempt_number + 1;
        if next_attempt > self.max_attempts {
            return None;
        }

        let candidate = Utc::now() + self.delay_before(next_attempt);
        if candidate - first_attempted_at > Duration::seconds(self.max_window_secs) {
            return None;
        }

        Some(candidate)
    }
}
