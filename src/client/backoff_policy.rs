//! Exponential backoff with jitter for the upstream client's retry policy
//! Retried with exponential backoff and jitter up to a bounded attempt count.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;

/// Retries `op` up to `max_attempts` times while `is_retryable` holds for the
/// returned error. Terminal errors (404/410-equivalents) should make
/// `is_retryable` return `false` so they fail on the first attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_attempts: u32,
    mut is_retryable: impl FnMut(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(5),
        multiplier: 2.0,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts.max(1) || !is_retryable(&err) {
                    return Err(err);
                }
                let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_backoff(
            3,
            |_| true,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom")
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_immediately_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_backoff(
            5,
            |_| false,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("terminal")
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(3, |_| true, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 1 { Err("retry me") } else { Ok(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
    }
}
