use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{StoreError, StoreResult, TransferError, TransferResult};

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Default delays with `max_attempts` total attempts
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set delay before the first retry
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set upper bound on any delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// No waiting between attempts
    pub fn immediate(mut self) -> Self {
        self.base_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self
    }

    /// Delay before retry number `retry` (1-based), doubling up to `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Sleep for the backoff delay unless the token fires first
pub(crate) async fn backoff(
    config: &RetryConfig,
    retry: u32,
    cancel: &CancellationToken,
) -> TransferResult<()> {
    let delay = config.delay_for(retry);
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(TransferError::Canceled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(TransferError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempts are used up.
///
/// Exhausted retries come back as [`TransferError::FatalTransfer`]; other
/// store errors are converted by kind.
pub(crate) async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> TransferResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Canceled),
            result = op() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(%err, attempt, max_attempts, "{} failed, retrying", what);
                backoff(config, attempt, cancel).await?;
            }
            Err(err) if err.is_transient() => return Err(exhausted(attempt, what, &err)),
            Err(err) => return Err(err.into()),
        }
    }
}

pub(crate) fn exhausted(attempts: u32, what: &str, err: &StoreError) -> TransferError {
    TransferError::fatal_transfer(attempts, format!("{}: {}", what, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let config = RetryConfig::new(5)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350));
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(350));
        assert_eq!(config.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = RetryConfig::new(3).immediate();

        let value = with_retry(&config, &cancel, "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::transient("reset"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_become_fatal() {
        let cancel = CancellationToken::new();
        let config = RetryConfig::new(2).immediate();

        let result: TransferResult<()> = with_retry(&config, &cancel, "op", || async {
            Err(StoreError::transient("reset"))
        })
        .await;

        assert!(matches!(result, Err(TransferError::FatalTransfer { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = RetryConfig::new(5).immediate();

        let result: TransferResult<()> = with_retry(&config, &cancel, "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::fatal("bad request"))
        })
        .await;

        assert!(matches!(result, Err(TransferError::Store { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
