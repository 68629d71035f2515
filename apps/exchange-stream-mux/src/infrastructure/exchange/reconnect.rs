//! Reconnection Policy
//!
//! Exponential backoff with optional jitter and a bounded retry budget.
//! Every failed connection attempt is recorded; the policy answers with the
//! delay before the next attempt, or `None` once the budget is spent.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Failed attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_factor,
            max_attempts,
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use exchange_stream_mux::infrastructure::exchange::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     jitter_factor: 0.0,
///     max_attempts: 2,
///     ..ReconnectConfig::default()
/// });
///
/// assert_eq!(policy.record_failure(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.record_failure(), None);
///
/// // Connected again: fresh budget.
/// policy.reset();
/// assert!(policy.should_retry());
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Record a failed attempt and get the delay before the next one.
    ///
    /// Returns `None` once `max_attempts` failures have been recorded.
    #[must_use]
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempt_count = self.attempt_count.saturating_add(1);
        if !self.should_retry() {
            return None;
        }

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let max_millis = self.config.max_delay.as_millis();
        let capped = next_millis.min(max_millis);
        let capped_u64 = u64::try_from(capped).unwrap_or(u64::MAX);
        self.current_delay = Duration::from_millis(capped_u64);

        Some(delay_with_jitter.min(self.config.max_delay))
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Failed attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// Configured budget (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Apply jitter to a duration.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter_factor - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn five_attempt_budget_yields_four_delays() {
        let mut policy = ReconnectPolicy::new(no_jitter(5));

        let delays: Vec<Duration> = std::iter::from_fn(|| policy.record_failure()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
        assert_eq!(policy.attempt_count(), 5);
        assert!(!policy.should_retry());
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let mut policy = ReconnectPolicy::new(no_jitter(12));
        let mut last = Duration::ZERO;

        while let Some(delay) = policy.record_failure() {
            assert!(delay >= last);
            assert!(delay <= Duration::from_secs(30));
            last = delay;
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn policy_max_delay_cap() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(2000),
            multiplier: 4.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        });

        assert_eq!(policy.record_failure(), Some(Duration::from_millis(1000)));
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn policy_reset() {
        let mut policy = ReconnectPolicy::new(no_jitter(3));

        let _ = policy.record_failure();
        let _ = policy.record_failure();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert!(policy.should_retry());
        assert_eq!(policy.record_failure(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn policy_jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 0,
            });

            let millis = policy.record_failure().unwrap().as_millis();

            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn unlimited_attempts() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));

        for _ in 0..1000 {
            assert!(policy.record_failure().is_some());
            assert!(policy.should_retry());
        }
    }
}
