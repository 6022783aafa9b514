//! Exponential backoff with jitter between same-model retries.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry behaviour for a single model before the engine fails over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum same-model retries before forcing a switch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay for the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap applied after jitter, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive attempts.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Symmetric jitter as a fraction of the computed delay (0.2 = ±20%).
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Computes exponential backoff delays with jitter.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    policy: RetryPolicy,
}

impl BackoffScheduler {
    /// Create a scheduler for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy this scheduler applies.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `base * multiplier^(attempt-1)` clamped to `max_delay_ms`, before
    /// jitter. Attempts are numbered from 1; 0 is treated as 1.
    pub fn base_delay(&self, attempt: u32, base_override: Option<u64>) -> u64 {
        let base = base_override.unwrap_or(self.policy.base_delay_ms) as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = base * self.policy.backoff_multiplier.max(1.0).powi(exponent);
        clamp_ms(raw, self.policy.max_delay_ms)
    }

    /// Delay before retry number `attempt`, with uniform ±jitter and the final
    /// value clamped to `max_delay_ms`. A non-finite `jitter_ratio` disables
    /// jitter.
    pub fn delay(&self, attempt: u32, base_override: Option<u64>) -> u64 {
        let delay = self.base_delay(attempt, base_override) as f64;
        let ratio = if self.policy.jitter_ratio.is_finite() {
            self.policy.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if ratio == 0.0 || delay == 0.0 {
            return delay as u64;
        }
        let spread = delay * ratio;
        let jittered = delay + rand::thread_rng().gen_range(-spread..=spread);
        clamp_ms(jittered, self.policy.max_delay_ms)
    }
}

fn clamp_ms(value: f64, max: u64) -> u64 {
    if !value.is_finite() || value >= max as f64 {
        max
    } else if value <= 0.0 {
        0
    } else {
        value.round() as u64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn scheduler(base: u64, max: u64, multiplier: f64, jitter: f64) -> BackoffScheduler {
        BackoffScheduler::new(RetryPolicy {
            max_retries: 5,
            base_delay_ms: base,
            max_delay_ms: max,
            backoff_multiplier: multiplier,
            jitter_ratio: jitter,
        })
    }

    #[test]
    fn backoff_computation() {
        let s = scheduler(500, 30_000, 2.0, 0.0);

        assert_eq!(s.base_delay(1, None), 500); // 500 * 2^0
        assert_eq!(s.base_delay(2, None), 1_000); // 500 * 2^1
        assert_eq!(s.base_delay(3, None), 2_000);
        assert_eq!(s.base_delay(4, None), 4_000);
        assert_eq!(s.base_delay(5, None), 8_000);
        assert_eq!(s.base_delay(6, None), 16_000);
        assert_eq!(s.base_delay(7, None), 30_000); // capped at max
        assert_eq!(s.delay(3, None), 2_000); // no jitter configured
    }

    #[test]
    fn attempt_zero_behaves_like_first_attempt() {
        let s = scheduler(500, 30_000, 2.0, 0.0);
        assert_eq!(s.base_delay(0, None), s.base_delay(1, None));
    }

    #[test]
    fn base_override_replaces_policy_base() {
        let s = scheduler(500, 30_000, 3.0, 0.0);
        assert_eq!(s.base_delay(1, Some(100)), 100);
        assert_eq!(s.base_delay(3, Some(100)), 900);
    }

    #[test]
    fn pre_jitter_delay_is_monotonic_and_bounded() {
        let s = scheduler(750, 20_000, 1.7, 0.2);
        let mut previous = 0;
        for attempt in 1..40 {
            let d = s.base_delay(attempt, None);
            assert!(d >= previous, "attempt {attempt}: {d} < {previous}");
            assert!(d <= 20_000);
            previous = d;
        }
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let s = scheduler(1_000, 60_000, 2.0, 0.2);
        for _ in 0..500 {
            let d = s.delay(2, None);
            assert!((1_600..=2_400).contains(&d), "delay {d} outside ±20% of 2000");
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let s = scheduler(1_000, 1_000, 2.0, 0.2);
        for _ in 0..200 {
            assert!(s.delay(4, None) <= 1_000);
        }
    }

    #[test]
    fn non_finite_jitter_is_ignored() {
        for ratio in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let s = scheduler(1_000, 30_000, 2.0, ratio);
            assert_eq!(s.delay(2, None), 2_000);
        }
    }

    #[test]
    fn out_of_range_jitter_is_clamped() {
        let s = scheduler(1_000, 30_000, 2.0, 5.0);
        for _ in 0..200 {
            assert!(s.delay(2, None) <= 4_000);
        }
        assert_eq!(scheduler(1_000, 30_000, 2.0, -1.0).delay(2, None), 2_000);
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let s = scheduler(1_000, 30_000, 2.0, 0.0);
        assert_eq!(s.base_delay(u32::MAX, None), 30_000);
    }

    #[test]
    fn policy_defaults_fill_missing_fields() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 1}"#).unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.base_delay_ms, 1_000);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert_eq!(policy.jitter_ratio, 0.2);
    }
}
