//! Retry engine.
//!
//! Attempt a unit of work, and on a retryable failure sleep a jittered
//! exponential backoff before trying again, up to a maximum attempt count.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::cancel::CancelToken;
use crate::deadline::Deadline;
use crate::status::{StatusCode, TempoError};

/// `{ maxAttempts>=1, initialBackoff>0, maxBackoff>=initialBackoff,
/// multiplier>0, retryableCodes }` (§3).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub retryable_codes: HashSet<StatusCode>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            multiplier: 2.0,
            retryable_codes: HashSet::new(),
        }
    }

    pub fn retryable(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.retryable_codes.extend(codes);
        self
    }

    fn is_retryable(&self, status: StatusCode) -> bool {
        self.retryable_codes.contains(&status)
    }

    /// Backoff before the `attempt`-th retry (1-based: the delay before the
    /// *second* overall attempt is `attempt=1`), before jitter.
    fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * exp).min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Key the wire attaches between retries: `tempo-previous-rpc-attempts`
/// (§4.4, §9 — value is the count of *prior* attempts, 1-based).
pub const PREVIOUS_ATTEMPTS_HEADER: &str = "tempo-previous-rpc-attempts";

/// Execute `work` per the algorithm in §4.4. `work` receives the 0-based
/// attempt index and a metadata callback is not modeled here directly —
/// callers set `tempo-previous-rpc-attempts` from the returned attempt
/// count between retries (see `ClientChannel`'s unary path).
pub async fn execute_with_retry<F, Fut, T>(
    mut work: F,
    policy: &RetryPolicy,
    deadline: Option<&Deadline>,
    cancel: Option<&CancelToken>,
) -> Result<T, TempoError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TempoError>>,
{
    let mut attempt: u32 = 0;
    let mut last_err: Option<TempoError> = None;

    loop {
        let attempt_fut = work(attempt);
        let result = match deadline {
            Some(d) => d.race(attempt_fut, cancel).await,
            None => match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        r = attempt_fut => r,
                        _ = token.cancelled() => Err(TempoError::new(StatusCode::Aborted, "call aborted")),
                    }
                }
                None => attempt_fut.await,
            },
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !policy.is_retryable(e.status) {
                    return Err(e);
                }
                attempt += 1;
                if attempt >= policy.max_attempts {
                    last_err = Some(e);
                    break;
                }
                let delay = jitter(policy.base_delay(attempt));
                if sleep_cancellable(delay, cancel).await.is_err() {
                    return Err(TempoError::new(StatusCode::Aborted, "call aborted"));
                }
                last_err = Some(e);
            }
        }
    }

    if let Some(token) = cancel {
        let already_aborted = last_err
            .as_ref()
            .map(|e| e.status == StatusCode::Aborted)
            .unwrap_or(false);
        if token.is_cancelled() && !already_aborted {
            return Err(TempoError::new(StatusCode::Aborted, "call aborted"));
        }
    }

    Err(last_err.unwrap_or_else(|| TempoError::new(StatusCode::DeadlineExceeded, "deadline exceeded")))
}

async fn sleep_cancellable(delay: Duration, cancel: Option<&CancelToken>) -> Result<(), ()> {
    match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(()),
                _ = tokio::time::sleep(delay) => Ok(()),
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(10), Duration::from_millis(100))
            .retryable([StatusCode::Unavailable])
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_retryable_failures_below_max() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = policy(5);
        let calls_clone = Arc::clone(&calls);
        let result = execute_with_retry(
            move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(TempoError::new(StatusCode::Unavailable, "down"))
                    } else {
                        Ok(99)
                    }
                }
            },
            &policy,
            None,
            None,
        )
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_with_final_error_when_k_reaches_max_attempts() {
        let policy = policy(3);
        let result: Result<i32, TempoError> = execute_with_retry(
            |_attempt| async { Err(TempoError::new(StatusCode::Unavailable, "still down")) },
            &policy,
            None,
            None,
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.status, StatusCode::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_status_is_not_retried() {
        let policy = policy(5);
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let result: Result<i32, TempoError> = execute_with_retry(
            move |_attempt| {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(TempoError::new(StatusCode::InvalidArgument, "bad"))
                }
            },
            &policy,
            None,
            None,
        )
        .await;
        assert_eq!(result.unwrap_err().status, StatusCode::InvalidArgument);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn base_delay_respects_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(250));
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(250));
    }
}
