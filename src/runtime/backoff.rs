use std::time::Duration;

const STEP: Duration = Duration::from_secs(1);

/// Linear reconnect backoff: `initial`, then one more second per failed
/// attempt, never above `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            failures: 0,
        }
    }

    /// Delay before the next attempt; each call counts as one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .initial
            .saturating_add(STEP.saturating_mul(self.failures))
            .min(self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_one_second() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.failures(), 3);
    }

    #[test]
    fn delays_are_monotonic_and_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(30));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn max_below_initial_is_raised() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }
}
