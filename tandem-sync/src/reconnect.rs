//! Reconnect pacing: exponential backoff with random jitter.

use rand::Rng;
use std::time::Duration;

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(30);
/// Upper bound of the random extra delay added to every attempt
pub const MAX_JITTER: Duration = Duration::from_secs(1);

/// Tracks consecutive failed connection attempts.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// `min(BASE_DELAY * 2^attempt, MAX_DELAY)`, without jitter.
    pub fn base_delay(attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
        let delay = Self::base_delay(self.attempt) + Duration::from_millis(jitter_ms);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Connection established.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles_then_caps() {
        assert_eq!(Backoff::base_delay(0), Duration::from_secs(1));
        assert_eq!(Backoff::base_delay(1), Duration::from_secs(2));
        assert_eq!(Backoff::base_delay(4), Duration::from_secs(16));
        assert_eq!(Backoff::base_delay(5), MAX_DELAY);
        assert_eq!(Backoff::base_delay(40), MAX_DELAY);
    }

    #[test]
    fn test_next_delay_within_jitter_bounds() {
        let mut backoff = Backoff::new();
        for attempt in 0..12 {
            let base = Backoff::base_delay(attempt);
            let delay = backoff.next_delay();
            assert!(delay >= base);
            assert!(delay <= base + MAX_JITTER);
        }
        assert_eq!(backoff.attempt(), 12);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= BASE_DELAY + MAX_JITTER);
    }
}
