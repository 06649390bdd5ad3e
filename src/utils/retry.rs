//! Retry utilities: backoff builders and reconnect helpers.
//!
//! Uses `backon` for exponential backoff with jitter. The publisher itself
//! never retries; these helpers are for composition roots that want to
//! reconnect to the broker at startup or after a transient failure.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, info, warn};

use crate::bus::BusError;

/// Backoff for broker connection retries.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Run `connect` until it succeeds, fails with a non-retryable error, or the
/// backoff is exhausted.
///
/// Returns the last error when giving up.
pub async fn connect_with_retry<T, F, Fut>(
    peer: &str,
    backoff: ExponentialBuilder,
    mut connect: F,
) -> Result<T, BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BusError>>,
{
    let mut delays = backoff.build();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(value) => {
                info!(peer = %peer, attempt, "Connected");
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                error!(peer = %peer, error = %e, "Connection failed, not retryable");
                return Err(e);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        peer = %peer,
                        attempt,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Connection failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(peer = %peer, attempt, error = %e, "Giving up connecting");
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff(max_times: usize) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_max_times(max_times)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);

        let value = connect_with_retry("broker", fast_backoff(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BusError::Connection("refused".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), BusError> = connect_with_retry("broker", fast_backoff(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(BusError::Topology {
                    exchange: "order-created".to_string(),
                    message: "mismatch".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(BusError::Topology { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_backoff_exhausted() {
        let calls = AtomicU32::new(0);

        let result: Result<(), BusError> = connect_with_retry("broker", fast_backoff(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BusError::Connection("refused".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(BusError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
