// src/network/backoff.rs
//! Reconnection backoff
//!
//! Exponential delays with a ceiling. Jitter only ever adds up to
//! `jitter` × the nominal delay and is clamped to the ceiling, so with a
//! multiplier of 2 consecutive delays never decrease and settle exactly on
//! the ceiling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// First delay, in milliseconds
    pub base_ms: u64,
    /// Ceiling, in milliseconds
    pub max_ms: u64,
    /// Extra random fraction of the nominal delay (0.0 ..= 0.5)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base_ms: 1_000,
            max_ms: 60_000,
            jitter: 0.1,
        }
    }
}

/// Delay sequence for consecutive failed attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Starts a fresh sequence
    pub fn new(policy: BackoffPolicy) -> Self {
        Backoff { policy, attempt: 0 }
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.policy.jitter.clamp(0.0, 0.5);
        let extra = (nominal as f64 * jitter * rand::random::<f64>()) as u64;
        Duration::from_millis(nominal.saturating_add(extra).min(self.ceiling()))
    }

    /// Back to the base delay, after a successful session
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn ceiling(&self) -> u64 {
        self.policy.max_ms.max(self.policy.base_ms)
    }

    fn nominal(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        self.policy.base_ms.saturating_mul(factor).min(self.ceiling())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_ceiling_without_jitter() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base_ms: 100,
            max_ms: 1_000,
            jitter: 0.0,
        });
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000, 1_000]);
    }

    #[test]
    fn jittered_delays_never_decrease_and_hold_at_ceiling() {
        for _ in 0..200 {
            let mut backoff = Backoff::new(BackoffPolicy::default());
            let delays: Vec<Duration> = (0..40).map(|_| backoff.next_delay()).collect();

            for pair in delays.windows(2) {
                assert!(pair[1] >= pair[0], "{:?} then {:?}", pair[0], pair[1]);
            }
            assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
            assert!(delays[10..].iter().all(|d| *d == Duration::from_secs(60)));
        }
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        });
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        for _ in 0..500 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }
}
