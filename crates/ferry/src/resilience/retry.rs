// Retry utility: shared retry-with-backoff logic for manifest polls, segment fetches and
// the resilient invoker.
//
// Classification comes from `FerryError::kind()`: only transient failures are retried.

use crate::error::FerryError;
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `step * n` before the n-th retry.
    Linear(Duration),
    /// `base * 2^(n-1)` before the n-th retry.
    Exponential(Duration),
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Hard cap on the computed delay to prevent unbounded growth.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, step/2) to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Linear(Duration::from_secs(1)),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Compute the delay before retry number `attempt + 1` (`attempt` is 0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let (step, computed) = match self.backoff {
            Backoff::Fixed(delay) => (delay, Some(delay)),
            Backoff::Linear(step) => (step, step.checked_mul(attempt.saturating_add(1))),
            Backoff::Exponential(base) => {
                // 2^attempt is computed with a checked shift so attempts >= 32 saturate.
                let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                (base, base.checked_mul(multiplier))
            }
        };
        let capped = computed.unwrap_or(self.max_delay).min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(step.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Execute an async operation, retrying transient failures with backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed).
/// Non-transient errors are returned immediately; once the retry budget is spent
/// the last transient error is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, FerryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FerryError>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(FerryError::Cancelled);
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };
        if attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => {
                return Err(FerryError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> FerryError {
        FerryError::Timeout { operation: "test" }
    }

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[test]
    fn linear_backoff_grows_by_step() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
    }

    #[test]
    fn exponential_delay_respects_max_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff: Backoff::Exponential(Duration::from_millis(500)),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn delay_with_jitter_does_not_exceed_max_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Fixed(Duration::from_millis(500)),
            max_delay: Duration::from_millis(600),
            jitter: true,
        };
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(3);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(600));
        }
    }

    #[tokio::test]
    async fn retry_fails_immediately_on_non_retryable() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&quick(3), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { Err(FerryError::protocol("handshake", "garbage")) }
        })
        .await;
        assert!(matches!(result, Err(FerryError::Protocol { .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_then_fails() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&quick(2), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { Err(transient()) }
        })
        .await;
        assert!(matches!(result, Err(FerryError::Timeout { .. })));
        // Initial attempt + 2 retries = 3 total
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&quick(3), &token, |attempt| async move {
            if attempt == 0 {
                Err(transient())
            } else {
                Ok(99u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn retry_respects_cancellation() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff: Backoff::Fixed(Duration::from_secs(100)),
            max_delay: Duration::from_secs(100),
            jitter: false,
        };
        let token = CancellationToken::new();
        let cancel = token.clone();
        let result: Result<u32, _> = retry_with_backoff(&policy, &token, |_| {
            cancel.cancel();
            async { Err(transient()) }
        })
        .await;
        assert!(matches!(result, Err(FerryError::Cancelled)));
    }
}
