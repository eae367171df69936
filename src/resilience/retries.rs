//! Retry logic for message delivery.
//!
//! # Responsibilities
//! - Decide whether a failed send is worth another attempt
//! - Execute attempts with exponential backoff + jitter
//! - Abandon the wait as soon as shutdown is requested
//!
//! # Design Decisions
//! - Configuration errors and closed transports are never retried
//! - Timeouts, transport errors and 4xx SMTP replies are transient

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::config::CampaignConfig;
use crate::messenger::MessengerError;
use crate::resilience::backoff::calculate_backoff;

/// How many times, and how patiently, to retry a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl From<&CampaignConfig> for RetryPolicy {
    fn from(config: &CampaignConfig) -> Self {
        Self {
            max_attempts: config.max_send_attempts.max(1),
            base_ms: config.retry_base_ms,
            max_ms: config.retry_max_ms,
        }
    }
}

/// Whether `err` may succeed on a later attempt.
pub fn is_retryable(err: &MessengerError) -> bool {
    match err {
        MessengerError::Timeout(_)
        | MessengerError::Transport(_)
        | MessengerError::Io(_)
        | MessengerError::Http(_) => true,
        MessengerError::Smtp { code, .. } => (400..500).contains(code),
        MessengerError::NotFound(_)
        | MessengerError::Closed(_)
        | MessengerError::Invalid { .. } => false,
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `shutdown` fires during a backoff wait. Returns the last error and
    /// the number of attempts made.
    pub async fn run<F, Fut>(
        &self,
        shutdown: &CancellationToken,
        mut op: F,
    ) -> (Result<(), MessengerError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), MessengerError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(()) => return (Ok(()), attempt),
                Err(e) => e,
            };
            if attempt >= self.max_attempts || !is_retryable(&err) {
                return (Err(err), attempt);
            }

            let delay = calculate_backoff(attempt, self.base_ms, self.max_ms);
            tracing::debug!(attempt, ?delay, error = %err, "Send failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return (Err(err), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_ms: 1,
            max_ms: 5,
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&MessengerError::Timeout("send".into())));
        assert!(is_retryable(&MessengerError::Smtp { code: 421, text: "busy".into() }));
        assert!(!is_retryable(&MessengerError::Smtp { code: 550, text: "no such user".into() }));
        assert!(!is_retryable(&MessengerError::Closed("email".into())));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let (result, attempts) = policy(5)
            .run(&token, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MessengerError::Transport("reset".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let token = CancellationToken::new();
        let (result, attempts) = policy(5)
            .run(&token, || async { Err(MessengerError::Closed("email".into())) })
            .await;
        assert!(matches!(result, Err(MessengerError::Closed(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let (result, attempts) = RetryPolicy {
            max_attempts: 10,
            base_ms: 10_000,
            max_ms: 10_000,
        }
        .run(&token, || async { Err(MessengerError::Transport("down".into())) })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
