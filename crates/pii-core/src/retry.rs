use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::{RETRY_BASE_SECS, RETRY_CAP_SECS, RETRY_FACTOR, RETRY_MAX_ATTEMPTS};

/// Run `op` up to `attempts` times, retrying only when `is_retryable`
/// returns true for the error. Delay starts at `base` seconds and doubles
/// each attempt (capped at `cap`), mirroring the channel-reconnect schedule
/// this pipeline's backoff is descended from, minus the jitter — callers
/// here are request handlers, not long-lived reconnect loops, so a
/// deterministic schedule keeps retry tests simple.
///
/// Every retried call site in this workspace uses the same
/// `(attempts=3, base=1s, factor=2, cap=10s)` policy (§7.2, §9); the
/// parameters are exposed so tests can exercise shorter schedules.
pub async fn with_backoff<T, E, F, Fut, R>(
    mut op: F,
    attempts: u32,
    base_secs: u64,
    factor: u64,
    cap_secs: u64,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut delay_secs = base_secs;
    let mut last_err = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt == attempts || !is_retryable(&e) => {
                return Err(e);
            }
            Err(e) => {
                warn!(
                    attempt,
                    max = attempts,
                    retry_after_secs = delay_secs,
                    "retrying after transient error"
                );
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                delay_secs = (delay_secs * factor).min(cap_secs);
                last_err = Some(e);
            }
        }
    }

    // Unreachable: attempts >= 1 means the loop always returns above, but
    // keep a fallback for attempts == 0 rather than panicking.
    Err(last_err.expect("attempts must be >= 1"))
}

/// Convenience wrapper using this pipeline's standard retry policy.
pub async fn with_standard_backoff<T, E, F, Fut, R>(op: F, is_retryable: R) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    with_backoff(
        op,
        RETRY_MAX_ATTEMPTS,
        RETRY_BASE_SECS,
        RETRY_FACTOR,
        RETRY_CAP_SECS,
        is_retryable,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_op_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            },
            3,
            0,
            2,
            1,
            |_: &&str| true,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_up_to_attempts_then_fails() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            },
            3,
            0,
            2,
            1,
            |_: &&str| true,
        )
        .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            },
            3,
            0,
            2,
            1,
            |_: &&str| false,
        )
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
