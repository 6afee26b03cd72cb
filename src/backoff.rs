// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exponential Backoff with Jitter
//!
//! Shared by reconnects and publish retries, each with its own schedule.
//! A delay is `min(max, base * 2^attempt) * random(0.5, 1.5)`, then clamped
//! between the previous delay and `max` so consecutive delays never shrink and
//! never exceed the cap.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        BackoffPolicy {
            base,
            max: max.max(base),
        }
    }

    /// Un-jittered delay for the given attempt.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule {
            policy: *self,
            attempt: 0,
            previous: Duration::ZERO,
        }
    }
}

/// Stateful sequence of delays for one retry loop.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    policy: BackoffPolicy,
    attempt: u32,
    previous: Duration,
}

impl BackoffSchedule {
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.policy.raw_delay(self.attempt);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = raw
            .mul_f64(jitter)
            .max(self.previous)
            .min(self.policy.max);

        self.attempt = self.attempt.saturating_add(1);
        self.previous = delay;
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5))
    }

    #[test]
    fn raw_delay_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.raw_delay(0), Duration::from_millis(100));
        assert_eq!(p.raw_delay(1), Duration::from_millis(200));
        assert_eq!(p.raw_delay(4), Duration::from_millis(1600));
        assert_eq!(p.raw_delay(10), Duration::from_secs(5));
        assert_eq!(p.raw_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn delays_are_monotonic_and_capped() {
        for _ in 0..50 {
            let mut schedule = policy().schedule();
            let mut previous = Duration::ZERO;
            for _ in 0..40 {
                let delay = schedule.next_delay();
                assert!(delay >= previous, "{delay:?} < {previous:?}");
                assert!(delay <= Duration::from_secs(5));
                previous = delay;
            }
            assert_eq!(previous, Duration::from_secs(5));
        }
    }

    #[test]
    fn reset_restarts_from_base() {
        let mut schedule = policy().schedule();
        for _ in 0..8 {
            schedule.next_delay();
        }
        schedule.reset();
        assert_eq!(schedule.attempt(), 0);

        let first = schedule.next_delay();
        assert!(first >= Duration::from_millis(50));
        assert!(first <= Duration::from_millis(150));
    }

    #[test]
    fn max_below_base_is_raised() {
        let p = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(p.max, Duration::from_secs(2));
    }
}
