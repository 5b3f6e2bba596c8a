use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 5_000;

/// Exponential backoff with +/-25% jitter for the given zero-based attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    let delay_ms = BASE_DELAY_MS
        .saturating_mul(2_u64.saturating_pow(attempt))
        .min(MAX_DELAY_MS);
    let jitter_range = delay_ms / 4;
    let jitter = fastrand::u64(0..=jitter_range * 2);
    Duration::from_millis(delay_ms.saturating_sub(jitter_range).saturating_add(jitter))
}

/// Re-run an async operation returning `crate::error::Result` while it fails
/// with a transient error.
macro_rules! retry_operation {
    ($context:expr, $operation:expr) => {{
        let context_value: String = $context.into();
        let mut attempt: u32 = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= $crate::retry::MAX_ATTEMPTS || !err.is_transient() => {
                    break Err(err)
                }
                Err(err) => {
                    let delay = $crate::retry::backoff_delay(attempt - 1);
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        $crate::retry::MAX_ATTEMPTS,
                        context_value,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_operation;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MarketError, Result};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_bounded() {
        for attempt in 0..10 {
            let delay = backoff_delay(attempt).as_millis() as u64;
            assert!(delay >= BASE_DELAY_MS * 3 / 4);
            assert!(delay <= MAX_DELAY_MS * 5 / 4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_operation!("flaky fetch", async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(MarketError::RateLimited {
                    provider: "test".to_string(),
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_operation!("bad symbol", async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MarketError::InvalidSymbol("???".to_string()))
        });
        assert!(matches!(result, Err(MarketError::InvalidSymbol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_operation!("always limited", async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MarketError::RateLimited {
                provider: "test".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
