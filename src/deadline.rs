//! Deadlines.
//!
//! An absolute UTC instant. `Deadline::race` wraps a future so it resolves
//! to `DEADLINE_EXCEEDED` the moment the deadline passes, and to `ABORTED`
//! if an external cancellation token fires first — the timer is cleared on
//! every exit path.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cancel::CancelToken;
use crate::status::{StatusCode, TempoError};

/// An absolute instant, stored as Unix milliseconds for wire transport
/// (`tempo-deadline`, §6) and compared against [`tokio::time::Instant`] via
/// the offset captured at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    unix_millis: u64,
}

impl Deadline {
    pub fn from_unix_millis(unix_millis: u64) -> Self {
        Self { unix_millis }
    }

    pub fn from_duration(duration: Duration) -> Self {
        let now = now_unix_millis();
        Self {
            unix_millis: now.saturating_add(duration.as_millis() as u64),
        }
    }

    pub fn unix_millis(&self) -> u64 {
        self.unix_millis
    }

    pub fn is_expired(&self) -> bool {
        now_unix_millis() >= self.unix_millis
    }

    /// Time remaining until expiry; zero if already expired.
    pub fn time_remaining(&self) -> Duration {
        let now = now_unix_millis();
        if now >= self.unix_millis {
            Duration::ZERO
        } else {
            Duration::from_millis(self.unix_millis - now)
        }
    }

    /// Race `work` against this deadline and, optionally, a cancellation
    /// token. Returns the first of: `work`'s value, a `DEADLINE_EXCEEDED`
    /// error once `time_remaining()` elapses, or an `ABORTED` error once
    /// `cancel` fires.
    pub async fn race<F, T>(&self, work: F, cancel: Option<&CancelToken>) -> Result<T, TempoError>
    where
        F: Future<Output = Result<T, TempoError>>,
    {
        let sleep = tokio::time::sleep(self.time_remaining());
        tokio::pin!(sleep);
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                result = &mut work => return result,
                _ = cancel_or_pending(cancel) => {
                    return Err(TempoError::new(StatusCode::Aborted, "call aborted"));
                }
                _ = &mut sleep => {
                    return Err(TempoError::new(
                        StatusCode::DeadlineExceeded,
                        "deadline exceeded",
                    ));
                }
            }
        }
    }
}

async fn cancel_or_pending(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn race_resolves_to_work_value_when_it_completes_first() {
        let deadline = Deadline::from_duration(Duration::from_secs(10));
        let work = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, TempoError>(42)
        };
        let result = deadline.race(work, None).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn race_fails_deadline_exceeded_when_work_is_too_slow() {
        let deadline = Deadline::from_duration(Duration::from_millis(10));
        let work = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TempoError>(42)
        };
        let err = deadline.race(work, None).await.unwrap_err();
        assert_eq!(err.status, StatusCode::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn race_fails_aborted_when_cancel_fires_first() {
        let deadline = Deadline::from_duration(Duration::from_secs(10));
        let token = CancelToken::new();
        let cancel_for_task = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel_for_task.cancel();
        });
        let work = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, TempoError>(42)
        };
        let err = deadline.race(work, Some(&token)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::Aborted);
    }

    #[test]
    fn is_expired_matches_time_remaining_zero() {
        let deadline = Deadline::from_unix_millis(1);
        assert!(deadline.is_expired());
        assert_eq!(deadline.time_remaining(), Duration::ZERO);
    }
}
