//! Reconnect pacing for the channel lifecycle supervisor.
//!
//! This module provides the [`RetryConfig`] type and the [`Backoff`] tracker
//! used by [`ChannelLifecycle`](crate::ChannelLifecycle) between lifecycle
//! attempts.
//!
//! # Retry Strategy
//!
//! - There is never a retry limit; outages are treated as transient and are
//!   expected to be resolved eventually by the connection supplier
//! - The default configuration restarts immediately, with no delay at all
//! - A non-zero `initial_delay` enables exponential backoff with randomized
//!   jitter, capped at `max_delay`
//! - The delay resets once an attempt reaches an open channel

use serde::{Deserialize, Serialize};
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

use crate::{PublishError, Result};

/// Delay policy applied between lifecycle attempts.
///
/// # Example
///
/// ```
/// use mom_publisher::RetryConfig;
/// use std::time::Duration;
///
/// let retry_config = RetryConfig {
///     initial_delay: Duration::from_millis(100),
///     multiplier: 2.0,
///     max_delay: Duration::from_secs(10),
/// };
/// assert!(!retry_config.is_immediate());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first restart after a failure. Zero means restart
    /// immediately, every time.
    pub initial_delay: Duration,

    /// Backoff multiplier applied to the delay after each consecutive failure.
    pub multiplier: f32,

    /// Maximum delay between attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// Immediate, unlimited restarts.
    fn default() -> Self {
        // ---
        Self {
            initial_delay: Duration::ZERO,
            multiplier: 2.0,
            max_delay: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    /// Whether this configuration restarts attempts without any delay.
    pub fn is_immediate(&self) -> bool {
        self.initial_delay.is_zero()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        // ---
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PublishError::InvalidConfig(format!(
                "retry multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Tracks consecutive failures and yields the delay before the next attempt.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: RetryConfig,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(config: RetryConfig) -> Self {
        // ---
        let current = config.initial_delay;
        Self { config, current }
    }

    /// Delay to wait before the next attempt, advancing the exponential
    /// sequence.
    pub(crate) fn next_delay(&mut self) -> Duration {
        // ---
        if self.config.is_immediate() {
            return Duration::ZERO;
        }

        let cap = self.config.max_delay.max(self.config.initial_delay);
        let delay = apply_jitter(self.current.min(cap));

        let grown = self.current.as_secs_f64() * f64::from(self.config.multiplier.max(1.0));
        let next = Duration::try_from_secs_f64(grown).unwrap_or(cap);
        self.current = next.min(cap);

        delay
    }

    /// Forget previous failures.
    pub(crate) fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    // Convert to 0.0..1.0 range
    let random_factor = (hash % 1000) as f64 / 1000.0;

    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::try_from_secs_f64(delay.as_secs_f64() * jitter_multiplier).unwrap_or(delay)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_default_is_immediate() {
        // ---
        let mut backoff = Backoff::new(RetryConfig::default());

        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::ZERO);
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        // ---
        let mut backoff = Backoff::new(RetryConfig {
            initial_delay: Duration::from_millis(100),
            multiplier: 10.0,
            max_delay: Duration::from_millis(400),
        });

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));

        // 100ms * 10 = 1s, capped to 400ms (±25%)
        for _ in 0..4 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(300), "too short: {delay:?}");
            assert!(delay <= Duration::from_millis(500), "too long: {delay:?}");
        }
    }

    #[test]
    fn test_reset_restarts_sequence() {
        // ---
        let mut backoff = Backoff::new(RetryConfig {
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
        });

        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();

        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_micros(12_500), "reset ignored: {delay:?}");
    }

    #[test]
    fn test_uncapped_growth_saturates() {
        // ---
        let mut backoff = Backoff::new(RetryConfig {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::MAX,
        });

        let mut last = Duration::ZERO;
        for _ in 0..200 {
            last = backoff.next_delay();
        }
        assert!(last >= Duration::from_secs(1 << 40), "stopped growing: {last:?}");
    }

    #[test]
    fn test_huge_multiplier_is_capped() {
        // ---
        let mut backoff = Backoff::new(RetryConfig {
            initial_delay: Duration::from_millis(100),
            multiplier: 1e30,
            max_delay: Duration::from_secs(60),
        });

        for _ in 0..5 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(75), "cap ignored: {delay:?}");
        }
    }

    #[test]
    fn test_validate_multiplier() {
        // ---
        assert!(RetryConfig::default().validate().is_ok());

        for multiplier in [f32::NAN, f32::INFINITY, 0.5] {
            let config = RetryConfig {
                multiplier,
                ..RetryConfig::default()
            };
            assert!(matches!(config.validate(), Err(PublishError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_jitter_range() {
        // ---
        let delay = Duration::from_millis(100);

        for _ in 0..100 {
            let jittered = apply_jitter(delay);

            assert!(
                jittered >= Duration::from_millis(75),
                "jitter too low: {jittered:?}",
            );
            assert!(
                jittered <= Duration::from_millis(125),
                "jitter too high: {jittered:?}",
            );
        }
    }
}
