use std::time::Duration;

use tracing::warn;

use crate::gateway::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Last error seen by `RetryPolicy::run` and how many calls were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub error: GatewayError,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Wait before attempt `attempt + 1`, doubling from `base_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Calls `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` calls have been made.
    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, GatewayError>,
    ) -> Result<T, Exhausted> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        step = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying: {error}"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(error) => return Err(Exhausted { error, attempts: attempt }),
            }
        }
    }
}
