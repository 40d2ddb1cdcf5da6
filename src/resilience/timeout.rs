use std::future::Future;
use std::time::Duration;

use super::PolicyError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Caps the duration of a single call. On expiry the underlying future is
/// dropped, so nothing after its last suspension point runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub duration: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub async fn call<F, T, E>(self, fut: F) -> Result<T, PolicyError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.duration, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PolicyError::Inner(e)),
            Err(_) => Err(PolicyError::Timeout(self.duration)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_fast_results() {
        let policy = TimeoutPolicy::new(Duration::from_millis(100));
        let ok: Result<u8, PolicyError<&str>> = policy.call(async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<u8, PolicyError<&str>> = policy.call(async { Err("boom") }).await;
        assert!(matches!(err, Err(PolicyError::Inner("boom"))));
    }

    #[tokio::test]
    async fn expires_slow_calls() {
        let policy = TimeoutPolicy::new(Duration::from_millis(10));
        let result: Result<(), PolicyError<&str>> = policy
            .call(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(PolicyError::Timeout(d)) if d == Duration::from_millis(10)));
    }

    #[test]
    fn defaults_to_five_seconds() {
        assert_eq!(TimeoutPolicy::default().duration, Duration::from_secs(5));
    }
}
