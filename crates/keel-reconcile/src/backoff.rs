//! Requeue delay calculation.
//!
//! The delay is derived from how long ago the notification was first
//! emitted, not from a per-message attempt counter. A notification that has
//! been bouncing for a long time waits longer between attempts, and every
//! worker in the fleet computes the same delay for the same notification
//! without shared state.
//!
//! For `elapsed = now - creation_time`:
//!
//! | elapsed | delay |
//! |---------|-------|
//! | `< initial` (or in the future) | `initial` |
//! | `> max` | `max` |
//! | otherwise | `min(2 * elapsed, max)` |

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default lower bound for requeue delays.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for requeue delays.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Bounds for requeue delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Smallest delay ever returned.
    pub initial: Duration,
    /// Largest delay ever returned.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Computes the delay for a notification created at `creation_time`.
    #[must_use]
    pub fn delay(&self, creation_time: DateTime<Utc>) -> Duration {
        self.delay_at(Utc::now(), creation_time)
    }

    /// Computes the delay as observed at `now`.
    #[must_use]
    pub fn delay_at(&self, now: DateTime<Utc>, creation_time: DateTime<Utc>) -> Duration {
        // Negative elapsed (clock skew) fails `to_std` and maps to the floor.
        let Ok(elapsed) = (now - creation_time).to_std() else {
            return self.initial;
        };
        if elapsed < self.initial {
            self.initial
        } else if elapsed > self.max {
            self.max
        } else {
            elapsed.saturating_mul(2).min(self.max)
        }
    }
}

/// Computes the requeue delay for `creation_time` with explicit bounds.
#[must_use]
pub fn delay(creation_time: DateTime<Utc>, initial: Duration, max: Duration) -> Duration {
    BackoffConfig::new(initial, max).delay(creation_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(now: DateTime<Utc>, secs_ago: i64) -> DateTime<Utc> {
        now - chrono::Duration::seconds(secs_ago)
    }

    #[test]
    fn fresh_notification_gets_initial_delay() {
        let now = Utc::now();
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_at(now, now), DEFAULT_INITIAL_DELAY);
    }

    #[test]
    fn mid_range_doubles_elapsed() {
        let now = Utc::now();
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_at(now, at(now, 10)), Duration::from_secs(20));
        assert_eq!(backoff.delay_at(now, at(now, 150)), Duration::from_secs(300));
    }

    #[test]
    fn doubling_is_clamped_to_max() {
        let now = Utc::now();
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_at(now, at(now, 200)), DEFAULT_MAX_DELAY);
        assert_eq!(backoff.delay_at(now, at(now, 3_600)), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn future_creation_time_gets_initial_delay() {
        let now = Utc::now();
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_at(now, at(now, -60)), DEFAULT_INITIAL_DELAY);
    }

    #[test]
    fn free_function_matches_config() {
        let created = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(
            delay(created, Duration::from_secs(2), Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    proptest! {
        #[test]
        fn delay_stays_within_bounds(
            initial_ms in 1_u64..10_000,
            extra_ms in 0_u64..600_000,
            elapsed_ms in -100_000_i64..10_000_000,
        ) {
            let backoff = BackoffConfig::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(initial_ms + extra_ms),
            );
            let now = Utc::now();
            let created = now - chrono::Duration::milliseconds(elapsed_ms);
            let d = backoff.delay_at(now, created);
            prop_assert!(d >= backoff.initial);
            prop_assert!(d <= backoff.max);
        }

        #[test]
        fn delay_is_monotonic_in_elapsed(
            a_ms in 0_i64..1_000_000,
            b_ms in 0_i64..1_000_000,
        ) {
            let (earlier, later) = if a_ms <= b_ms { (a_ms, b_ms) } else { (b_ms, a_ms) };
            let backoff = BackoffConfig::default();
            let now = Utc::now();
            let short = backoff.delay_at(now, now - chrono::Duration::milliseconds(earlier));
            let long = backoff.delay_at(now, now - chrono::Duration::milliseconds(later));
            prop_assert!(short <= long);
        }
    }
}
