use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SyncSettings;
use crate::errors::{AppError, AppResult};
use crate::gmail::{MailProvider, RemoteMessage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Zero retries immediately; otherwise the n-th retry waits `base_delay * 2^(n-1)`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(3)
    }
}

impl RetryPolicy {
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            attempts: settings.fetch_attempts,
            base_delay: settings.fetch_backoff,
        }
    }

    fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

#[derive(Debug)]
pub enum RetryFailure {
    Cancelled,
    Exhausted { attempts: u32, last: AppError },
}

/// Runs `op` until it succeeds, the policy's attempts are used up, or `cancel` fires.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryFailure::Cancelled);
        }
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(last) if attempt >= attempts => {
                return Err(RetryFailure::Exhausted {
                    attempts: attempt,
                    last,
                })
            }
            Err(e) => {
                debug!(attempt, error = %e, "Attempt failed; retrying");
                let delay = policy.delay_after(attempt);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Retrieves the full message (headers and MIME tree). Exhausting the retry
/// policy is fatal and wraps the last underlying error.
pub async fn fetch_full_message(
    client: &dyn MailProvider,
    message_id: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> AppResult<RemoteMessage> {
    match retry_async(policy, cancel, || client.get_message(message_id)).await {
        Ok(message) => Ok(message),
        Err(RetryFailure::Cancelled) => Err(AppError::Cancelled),
        Err(RetryFailure::Exhausted { attempts, last }) => {
            warn!(message = %message_id, attempts, error = %last, "Giving up on message");
            Err(AppError::RetriesExhausted {
                message_id: message_id.to_string(),
                attempts,
                source: Box::new(last),
            })
        }
    }
}
