//! Backoff strategies for the orchestrator's two retry loops (§4.5 "Retry and
//! backoff"): the update-fetch/store loop, seeded from the update poll
//! interval and capped by a configured attempt ceiling, and the
//! status-report loop, whose attempt ceiling is derived from the poll and
//! retry intervals rather than configured directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff, capped and jittered.
///
/// Mirrors the teacher's predefined-policy shape but this orchestrator only
/// ever seeds `base_delay` from the configured poll interval (§4.5), so there
/// is a single strategy rather than a `RetryPolicy` preset enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor: 0.0 = no jitter, 1.0 = full jitter (delay * [0, 2]).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    6
}
fn default_jitter() -> f64 {
    0.5
}

impl BackoffConfig {
    /// Seed a backoff schedule from the update poll interval, per §4.5:
    /// "exponential backoff seeded from the update poll interval".
    pub fn from_poll_interval(poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: poll_interval,
            max_delay: poll_interval.saturating_mul(16),
            jitter: 0.5,
        }
    }
}

/// Exponential delay for `attempt` (1-indexed), capped at `max_delay` and
/// jittered by `jitter`.
pub fn calculate_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let delay = config.base_delay.saturating_mul(2_u32.saturating_pow(pow));
    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// The status-report retry ceiling (§4.5): `min(poll_interval /
/// retry_interval * 2, 10)`, floored at a minimum of 3 attempts.
pub fn status_report_max_attempts(poll_interval: Duration, retry_interval: Duration) -> u32 {
    if retry_interval.is_zero() {
        return 10;
    }
    let ratio = poll_interval.as_secs_f64() / retry_interval.as_secs_f64();
    let computed = (ratio * 2.0).floor() as i64;
    computed.clamp(3, 10) as u32
}

/// Whether `attempt` (1-indexed, the attempt about to be made) has already
/// exhausted `max_attempts`.
pub fn exhausted(attempt: u32, max_attempts: u32) -> bool {
    attempt > max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_without_jitter_doubles() {
        let config = BackoffConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(4));
    }

    #[test]
    fn exponential_is_capped_at_max_delay() {
        let config = BackoffConfig {
            max_attempts: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(10));
    }

    #[test]
    fn from_poll_interval_seeds_base_delay() {
        let config = BackoffConfig::from_poll_interval(Duration::from_secs(30), 5);
        assert_eq!(config.base_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn status_report_attempts_respects_minimum() {
        // poll=30s, retry=60s -> ratio*2 = 1, floored to the minimum of 3.
        let attempts = status_report_max_attempts(Duration::from_secs(30), Duration::from_secs(60));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn status_report_attempts_respects_maximum() {
        // poll=600s, retry=10s -> ratio*2 = 120, capped to 10.
        let attempts = status_report_max_attempts(Duration::from_secs(600), Duration::from_secs(10));
        assert_eq!(attempts, 10);
    }

    #[test]
    fn status_report_attempts_in_range() {
        // poll=60s, retry=30s -> ratio*2 = 4.
        let attempts = status_report_max_attempts(Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(attempts, 4);
    }

    #[test]
    fn exhausted_is_strict() {
        assert!(!exhausted(6, 6));
        assert!(exhausted(7, 6));
    }
}
