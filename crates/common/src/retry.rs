use std::time::Duration;

/// Exponential backoff schedule: `base`, `2 * base`, `4 * base`, ... capped
/// at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Call `f` until it succeeds or `backoff.max_attempts` calls have failed.
/// A zero attempt count still calls once.
pub fn retry_with_backoff<F, T, E>(mut f: F, backoff: &Backoff, operation: &str) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let attempts = backoff.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < attempts => {
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(operation, attempts, error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}
