//! Bounded retry with exponential backoff and deterministic jitter.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::TransportError;

/// First backoff delay in milliseconds.
const BACKOFF_BASE_MS: u64 = 500;
/// Ceiling on any single backoff delay.
const BACKOFF_MAX_MS: u64 = 15_000;
/// Attempts before the last error is surfaced.
const MAX_ATTEMPTS: u32 = 4;
/// Jitter fraction applied to each delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Run `op` until it succeeds, the error is non-retryable, or attempts run
/// out. Rate-limit errors honor the server-provided delay instead of the
/// backoff schedule.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut delay_ms = BACKOFF_BASE_MS;

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt == MAX_ATTEMPTS => return Err(e),
            Err(TransportError::RateLimited { retry_after_ms }) => {
                warn!(op = label, attempt, retry_after_ms, "rate limited, waiting");
                sleep(Duration::from_millis(retry_after_ms)).await;
            }
            Err(e) => {
                let total = delay_ms + jitter_ms(delay_ms);
                warn!(op = label, attempt, error = %e, retry_in_ms = total, "transport call failed, retrying");
                sleep(Duration::from_millis(total)).await;
                delay_ms = (delay_ms * 2).min(BACKOFF_MAX_MS);
            }
        }
    }

    unreachable!("backoff loop exited without returning")
}

/// Jitter offset (0 … `JITTER_FRACTION * base_ms`) derived from the current
/// monotonic timestamp, avoiding a rand dependency.
fn jitter_ms(base_ms: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let max_jitter = ((base_ms as f64) * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return 0;
    }
    (nanos as u64) % max_jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TransportError::Request("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::MessageDeleted { id: 7 }) }
        })
        .await;
        assert!(matches!(
            result,
            Err(TransportError::MessageDeleted { id: 7 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
