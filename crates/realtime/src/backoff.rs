//! Reconnect policy: how many times to retry and how long to wait in between.

use std::time::Duration;

/// Shape of the delay curve between reconnect attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `base * attempt`
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" | "exp" => Ok(BackoffStrategy::Exponential),
            other => Err(format!("'{}' is not a backoff strategy", other)),
        }
    }
}

/// Retry limit plus the delay curve used by the session driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Linear,
        }
    }
}

impl RetryPolicy {
    pub fn new(limit: u32, base_delay: Duration) -> Self {
        Self {
            limit,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Whether another reconnect may be scheduled after `retry_count` retries.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.limit
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`. Attempt `0`
    /// maps to no delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        raw.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100))
            .with_strategy(BackoffStrategy::Exponential)
            .with_max_delay(Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        // Shift overflow must still land on the cap.
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_delays_never_decrease() {
        for strategy in [BackoffStrategy::Linear, BackoffStrategy::Exponential] {
            let policy = RetryPolicy::new(u32::MAX, Duration::from_millis(250))
                .with_strategy(strategy)
                .with_max_delay(Duration::from_secs(5));
            let mut previous = Duration::ZERO;
            for attempt in 0..64 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= previous, "{:?} decreased at {}", strategy, attempt);
                assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_allows_respects_limit() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));

        let never = RetryPolicy::new(0, Duration::from_millis(100));
        assert!(!never.allows(0));
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("linear".parse(), Ok(BackoffStrategy::Linear));
        assert_eq!("Exponential".parse(), Ok(BackoffStrategy::Exponential));
        assert!("fibonacci".parse::<BackoffStrategy>().is_err());
    }
}
