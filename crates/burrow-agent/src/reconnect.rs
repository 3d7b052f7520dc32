//! Exponential reconnect backoff.

use std::time::Duration;

/// Backoff configuration. Defaults: start at 1 s, double each failure,
/// cap at 5 min, retry forever.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries without limit.
    pub max_attempts: Option<usize>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
            max_attempts: None,
        }
    }
}

/// Tracks the delay between reconnect attempts.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempt: 0,
        }
    }

    /// Delay to sleep before the next attempt, or `None` once the attempt
    /// budget is spent. Doubles the following delay up to the cap.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return None;
            }
        }

        let delay = self.current;
        self.current = (self.current * 2).min(self.config.max);
        Some(delay)
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: Option<usize>) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(80),
            max_attempts,
        }
    }

    #[test]
    fn doubles_until_the_cap() {
        let mut backoff = Backoff::new(config(None));

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(80)));
        // Capped.
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(80)));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(config(None));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn attempt_budget_runs_out() {
        let mut backoff = Backoff::new(config(Some(2)));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
    }
}
