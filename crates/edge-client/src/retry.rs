//! Retry with capped exponential backoff
//!
//! `delay = initial * multiplier^(attempt-1)`, clamped to `max_delay`.
//! An operation returns [`RetryError::Stop`] for failures that can never
//! succeed (400/404), which ends the loop immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ClientError;

/// Backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Single attempt, no sleeping
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let clamped = if base.is_nan() || base < 0.0 {
            0.0
        } else {
            base.min(max)
        };
        Duration::from_secs_f64(clamped)
    }
}

/// Failure of one attempt
#[derive(Debug)]
pub enum RetryError<E> {
    /// Permanent failure; do not retry
    Stop(E),
    /// Might succeed later
    Transient(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Stop(e) | RetryError::Transient(e) => e,
        }
    }
}

impl From<ClientError> for RetryError<ClientError> {
    fn from(e: ClientError) -> Self {
        if e.is_terminal() {
            RetryError::Stop(e)
        } else {
            RetryError::Transient(e)
        }
    }
}

/// Run `operation` until it succeeds, stops, or attempts run out.
pub async fn with_backoff<F, Fut, T, E>(policy: &Backoff, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(RetryError::Stop(e)) => {
                debug!(attempt, error = %e, "Not retrying permanent failure");
                return Err(e);
            }
            Err(RetryError::Transient(e)) => {
                if attempt >= policy.max_attempts.max(1) {
                    warn!(attempt, error = %e, "Retries exhausted");
                    return Err(e);
                }
                let delay = policy.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_delay_is_capped() {
        let policy = Backoff::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, ClientError> = with_backoff(&Backoff::default(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClientError::Timeout.into())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_short_circuits() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), ClientError> = with_backoff(&Backoff::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::NotFound("urls".into()).into())
        })
        .await;

        assert!(matches!(result, Err(ClientError::NotFound(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = Backoff {
            max_attempts: 3,
            ..Backoff::default()
        };
        let result: Result<(), ClientError> = with_backoff(&policy, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::server_error(503, "busy").into())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
