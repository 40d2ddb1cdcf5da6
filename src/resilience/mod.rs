//! Failure-containment policies wrapped around every call into a dependency.
//!
//! Composition order is fixed: timeout innermost, retry around the timeout,
//! circuit breaker outermost. An open breaker short-circuits the retries.

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use circuit_breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
};
pub use retry::{Backoff, RetryPolicy};
pub use timeout::TimeoutPolicy;

#[derive(Debug, Error)]
pub enum PolicyError<E> {
    #[error("Circuit breaker open: {0}")]
    Rejected(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Inner(E),
}

/// Breaker, retry and timeout composed around one call site.
#[derive(Clone)]
pub struct ResiliencePolicy {
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: TimeoutPolicy,
}

impl ResiliencePolicy {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy, timeout: TimeoutPolicy) -> Self {
        Self {
            breaker,
            retry,
            timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn timeout(&self) -> TimeoutPolicy {
        self.timeout
    }

    /// Runs `op` under all three policies. `op` is invoked once per attempt.
    pub async fn call<F, Fut, T, E>(&self, mut op: F) -> Result<T, PolicyError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let timeout = self.timeout;
        self.breaker
            .call(self.retry.call(|| timeout.call(op())))
            .await
    }
}
