use std::time::Duration;

/// Backoff schedule for senders that hit a full signal queue.
///
/// The control plane runs at human timescales, so defaults favour patience
/// over latency: 8 attempts from 1ms, doubling, capped at 64ms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts after the first failed push before giving up with `QueueFull`.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(64),
        }
    }
}

impl RetryConfig {
    /// Fail immediately on a full queue.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Upper bound on time spent sleeping before the last attempt.
    pub fn total_budget(&self) -> Duration {
        (0..self.max_attempts).map(|a| self.delay_for_attempt(a)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8));
        assert_eq!(config.delay_for_attempt(6), Duration::from_millis(64));
        assert_eq!(config.delay_for_attempt(7), Duration::from_millis(64));
        // 2^40 would overflow u32
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(64));
    }

    #[test]
    fn test_total_budget() {
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_micros(50),
            max_delay: Duration::from_micros(150),
        };
        // 50 + 100 + 150 + 150
        assert_eq!(config.total_budget(), Duration::from_micros(450));
        assert_eq!(RetryConfig::no_retry().total_budget(), Duration::ZERO);
    }
}
