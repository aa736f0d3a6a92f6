//! Retry engine (C7): the declarative wrapper used both internally by
//! decorated session methods and externally via `with_retries`.

use std::future::Future;
use std::time::Instant;

use tokio_retry::strategy::jitter;

use ydb_shared::{RetryClass, RetryParameters, StatusCode, YdbError, YdbResult};

/// Classifies a `YdbError` per spec.md section 4.7 / 7. Errors that don't
/// carry a server status code (timeouts, transport failures, programmer
/// errors) are mapped onto the same four buckets directly.
pub fn classify_error(err: &YdbError) -> RetryClass {
    match err {
        YdbError::TimeoutExpired(_) | YdbError::Transport { .. } => RetryClass::RetryableSlow,
        YdbError::Status { status, .. } => status.classify(),
        YdbError::Scheme(_) => StatusCode::SchemeError.classify(),
        YdbError::EmptyPayload(_)
        | YdbError::InvalidArgument(_)
        | YdbError::Destroyed(_)
        | YdbError::NoSessionAvailable(_)
        | YdbError::Auth(_) => RetryClass::Fatal,
    }
}

/// The public surface used by user code and internally by decorated session
/// methods. Retries `op` until it succeeds, hits a fatal/session-broken
/// classification, exhausts `params.max_retries`, or exceeds
/// `params.deadline` — whichever comes first — then re-raises the last
/// classified error.
pub async fn with_retries<F, Fut, T>(mut op: F, params: RetryParameters) -> YdbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = YdbResult<T>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify_error(&err);
                let budget_exhausted =
                    attempt >= params.max_retries || start.elapsed() > params.deadline;

                if budget_exhausted || matches!(class, RetryClass::Fatal | RetryClass::SessionBroken) {
                    tracing::debug!(
                        attempt,
                        elapsed = ?start.elapsed(),
                        class = ?class,
                        "with_retries giving up"
                    );
                    return Err(err);
                }

                let base_delay = match class {
                    RetryClass::RetryableFast if attempt == 0 => std::time::Duration::ZERO,
                    _ => params.backoff_for_attempt(attempt),
                };
                let delay = jitter(base_delay);
                tracing::debug!(attempt, ?delay, class = ?class, "with_retries backing off");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_within_budget() {
        let calls = AtomicU32::new(0);
        let params = RetryParameters::default().with_max_retries(5);
        let result: YdbResult<i32> = with_retries(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(YdbError::status(StatusCode::Overloaded, "overloaded"))
                    } else {
                        Ok(42)
                    }
                }
            },
            params,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_once_max_retries_exhausted() {
        let calls = AtomicU32::new(0);
        let params = RetryParameters::default().with_max_retries(3);
        let result: YdbResult<i32> = with_retries(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(YdbError::status(StatusCode::Overloaded, "still overloaded")) }
            },
            params,
        )
        .await;
        assert!(result.is_err());
        // attempt 0 (initial) + 3 retries = 4 calls total
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_are_never_retried() {
        let calls = AtomicU32::new(0);
        let result: YdbResult<i32> = with_retries(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(YdbError::InvalidArgument("bad path".to_string())) }
            },
            RetryParameters::default(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_broken_errors_are_never_retried_here() {
        let calls = AtomicU32::new(0);
        let result: YdbResult<i32> = with_retries(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(YdbError::status(StatusCode::BadSession, "bad session")) }
            },
            RetryParameters::default(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_once_deadline_elapses() {
        let params = RetryParameters::default()
            .with_max_retries(1000)
            .with_deadline(Duration::from_millis(10));
        let calls = AtomicU32::new(0);
        let result: YdbResult<i32> = with_retries(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(YdbError::status(StatusCode::Overloaded, "overloaded"))
                }
            },
            params,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
