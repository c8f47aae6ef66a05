//! Exponential backoff between registration attempts.

use std::time::Duration;

use crate::config::RegistrationConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    max_attempts: Option<u32>,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            max_attempts,
            failures: 0,
        }
    }

    pub fn from_config(config: &RegistrationConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Delay after the `failure`-th consecutive failure (1-based)
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1).min(31);
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.ceiling)
    }

    /// Record a failure; `None` once the attempt budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        match self.max_attempts {
            Some(max) if self.failures >= max => None,
            _ => Some(self.delay_for(self.failures)),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), None);

        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(6), Duration::from_secs(32));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(60)); // capped
        assert_eq!(backoff.delay_for(500), Duration::from_secs(60));
    }

    #[test]
    fn test_delays_never_decrease() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10), None);
        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }
    }

    #[test]
    fn test_attempt_budget() {
        let mut backoff =
            Backoff::new(Duration::from_millis(10), Duration::from_secs(1), Some(3));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.failures(), 3);
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_from_config_defaults() {
        let backoff = Backoff::from_config(&RegistrationConfig::default());
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(30), Duration::from_secs(300));
    }
}
