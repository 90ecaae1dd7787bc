use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::models::{JobPhase, RetryPolicy};
use crate::error::BackupError;

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. Backoff sleeps are interrupted by `cancel`.
///
/// `attempts` is incremented once per attempt so callers can keep a total.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    phase: JobPhase,
    cancel: Option<&CancellationToken>,
    attempts: &mut u32,
    mut op: F,
) -> Result<T, BackupError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackupError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        *attempts += 1;
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= max_attempts {
            return Err(error);
        }

        let delay = policy.backoff_for(attempt);
        warn!(
            phase = %phase,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(BackupError::Aborted { phase }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        attempt += 1;
    }
}

/// Bound `fut` by `limit`; expiry is reported as the phase's timeout.
pub async fn with_timeout<T, Fut>(phase: JobPhase, limit: Duration, fut: Fut) -> Result<T, BackupError>
where
    Fut: Future<Output = Result<T, BackupError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackupError::Timeout {
            phase,
            after: limit,
        }),
    }
}

/// Race `fut` against shutdown.
pub async fn abortable<T, Fut>(
    phase: JobPhase,
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<T, BackupError>
where
    Fut: Future<Output = Result<T, BackupError>>,
{
    if cancel.is_cancelled() {
        return Err(BackupError::Aborted { phase });
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Aborted { phase }),
        result = fut => result,
    }
}
