use std::time::Duration;

use rand::Rng;

/// Exponential backoff with up to one second of random jitter, used when the
/// database connection drops.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, without jitter.
    pub fn current(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt, with jitter. Advances the attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.attempt = self.attempt.saturating_add(1);
        let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
        delay + jitter
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(backoff.current());
            backoff.next_delay();
        }
        assert_eq!(
            seen,
            [1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn jitter_stays_under_a_second() {
        let mut backoff = Backoff::default();
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(500));
        assert!(delay < Duration::from_millis(1500));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(500));
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::from_secs(30));
    }
}
