//! Reconnection delay policies.
//!
//! The socket consults a [`ReconnectPolicy`] each time it schedules a
//! reconnect attempt and resets it once a connection completes its handshake.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Decides how long to wait before each reconnect attempt.
pub trait ReconnectPolicy: Send {
    /// Returns the delay to apply before the next attempt and advances the
    /// policy's internal attempt counter.
    fn next(&mut self) -> Duration;

    /// Called after a successful reconnection so the next failure starts the
    /// delay curve from the beginning.
    fn reset(&mut self);
}

/// Exponential backoff with bounded doubling and lightweight jitter.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for delay growth.
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
    attempt: usize,
}

impl ExponentialBackoff {
    /// Creates a policy with explicit bounds and no attempts recorded.
    pub fn new(initial_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            jitter,
            attempt: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_delay);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(20),
            Duration::from_millis(250),
        )
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next(&mut self) -> Duration {
        self.attempt += 1;
        self.delay_for_attempt(self.attempt)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ExponentialBackoff, ReconnectPolicy};

    fn jitterless(initial_ms: u64, max_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            Duration::ZERO,
        )
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut policy = jitterless(100, 450);
        assert_eq!(policy.next(), Duration::from_millis(100));
        assert_eq!(policy.next(), Duration::from_millis(200));
        assert_eq!(policy.next(), Duration::from_millis(400));
        assert_eq!(policy.next(), Duration::from_millis(450));
        assert_eq!(policy.next(), Duration::from_millis(450));
    }

    #[test]
    fn reset_restarts_the_curve() {
        let mut policy = jitterless(100, 1000);
        policy.next();
        policy.next();
        policy.reset();
        assert_eq!(policy.next(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut policy = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        for _ in 0..32 {
            let delay = policy.next();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
