//! Backoff applied before a failed batch is retried.

use crate::config::RunnerConfig;
use std::time::Duration;

/// Delay before retrying a batch that has failed `attempts` times.
///
/// Grows linearly with the migration interval, so a failing batch never runs more often
/// than healthy ones, and is capped at `max_retry_delay`. Jitter applies when
/// `retry_jitter` is set.
pub fn calculate_retry_delay(config: &RunnerConfig, interval: Duration, attempts: u32) -> Duration {
    calculate_retry_delay_with_jitter(config, interval, attempts, config.retry_jitter)
}

fn calculate_retry_delay_with_jitter(
    config: &RunnerConfig,
    interval: Duration,
    attempts: u32,
    apply_jitter: bool,
) -> Duration {
    use rand::Rng;

    let interval_ms = interval.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = config.max_retry_delay.as_millis().min(u64::MAX as u128) as u64;
    let base_delay_ms = interval_ms.saturating_mul(attempts.max(1) as u64).min(max_ms);

    if !apply_jitter || base_delay_ms == 0 {
        return Duration::from_millis(base_delay_ms);
    }

    let jitter_range = (base_delay_ms as f64 * 0.1) as u64;
    if jitter_range == 0 {
        return Duration::from_millis(base_delay_ms);
    }

    let mut rng = rand::thread_rng();
    let jitter: i64 = rng.gen_range(-(jitter_range as i64)..=(jitter_range as i64));
    let final_delay_ms = (base_delay_ms as i64 + jitter).max(1) as u64;

    Duration::from_millis(final_delay_ms.min(max_ms))
}

/// Delay without jitter. Deterministic, for tests.
pub fn calculate_retry_delay_no_jitter(
    config: &RunnerConfig,
    interval: Duration,
    attempts: u32,
) -> Duration {
    calculate_retry_delay_with_jitter(config, interval, attempts, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(120);

    #[test]
    fn delay_grows_with_attempts() {
        let config = RunnerConfig::default();
        assert_eq!(
            calculate_retry_delay_no_jitter(&config, INTERVAL, 1),
            Duration::from_secs(120)
        );
        assert_eq!(
            calculate_retry_delay_no_jitter(&config, INTERVAL, 2),
            Duration::from_secs(240)
        );
        assert_eq!(
            calculate_retry_delay_no_jitter(&config, INTERVAL, 3),
            Duration::from_secs(360)
        );
    }

    #[test]
    fn delay_is_capped() {
        let config = RunnerConfig {
            max_retry_delay: Duration::from_secs(300),
            ..Default::default()
        };
        assert_eq!(
            calculate_retry_delay_no_jitter(&config, INTERVAL, 10),
            Duration::from_secs(300)
        );
        assert_eq!(
            calculate_retry_delay_no_jitter(&config, Duration::MAX, u32::MAX),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn zero_attempts_waits_one_interval() {
        let config = RunnerConfig::default();
        assert_eq!(calculate_retry_delay_no_jitter(&config, INTERVAL, 0), INTERVAL);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let config = RunnerConfig {
            retry_jitter: true,
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = calculate_retry_delay(&config, INTERVAL, 2);
            assert!(delay >= Duration::from_secs(216), "{delay:?}");
            assert!(delay <= Duration::from_secs(264), "{delay:?}");
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let config = RunnerConfig {
            retry_jitter: true,
            max_retry_delay: Duration::from_secs(200),
            ..Default::default()
        };
        for _ in 0..100 {
            assert!(calculate_retry_delay(&config, INTERVAL, 5) <= Duration::from_secs(200));
        }
    }
}
