use std::fmt;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: u32, max_delay: Duration },
}

/// Re-invokes a failed call. Only for operations that are safe to repeat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_DELAY)
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration, factor: u32, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Exponential { factor, max_delay },
        }
    }

    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max_delay } => {
                let exponent = attempt.saturating_sub(1);
                let multiplier = factor.max(1).saturating_pow(exponent);
                self.delay.saturating_mul(multiplier).min(max_delay)
            }
        }
    }

    pub async fn call<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let delay = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::warn!(attempt, error = %e, "Retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "Attempt failed, retrying");
                    delay
                }
            };
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
