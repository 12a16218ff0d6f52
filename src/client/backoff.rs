//! Retry delay schedule

use std::time::Duration;

/// Upper bound on a single retry delay
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... for a bounded
/// number of retries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_retries: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_retries: u32) -> Self {
        ExponentialBackoff {
            base_delay_ms,
            max_retries,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` once retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let factor = 1u64 << self.attempt.min(16);
        self.attempt += 1;
        let delay = Duration::from_millis(self.base_delay_ms.saturating_mul(factor));
        Some(delay.min(MAX_DELAY))
    }

    /// Retries used so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = ExponentialBackoff::new(100, 3);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_backoff_capped() {
        let mut backoff = ExponentialBackoff::new(20_000, 5);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Some(MAX_DELAY));
    }

    #[test]
    fn test_no_retries() {
        let mut backoff = ExponentialBackoff::new(100, 0);
        assert!(backoff.next_delay().is_none());
    }
}
