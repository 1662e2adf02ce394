//! Retry classification and bounded backoff for store calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};

/// Retry policy classification for store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        401 | 403 => SyncRetryClass::ReauthRequired,
        408 | 423 | 425 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}

/// Exponential backoff in milliseconds with cap.
pub fn backoff_millis(consecutive_failures: u32, base: Duration, max: Duration) -> u64 {
    const MAX_EXPONENT: u32 = 8;

    let capped = consecutive_failures.min(MAX_EXPONENT);
    let base_ms = base.as_millis() as u64;
    (base_ms.saturating_mul(2_u64.pow(capped))).min(max.as_millis() as u64)
}

/// Bounds for retrying one store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the next attempt, with up to 20% jitter.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = backoff_millis(attempt, self.base_backoff, self.max_backoff);
        let jitter_cap = (base / 5).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        Duration::from_millis(base.saturating_add(jitter))
    }
}

/// Runs `call` under `timeout`, retrying retryable failures within `policy`.
///
/// Permanent and credential failures are returned on the first occurrence.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    label: &str,
    mut call: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.retry_class() == SyncRetryClass::Retryable && attempt < max_attempts => {
                let delay = policy.backoff_with_jitter(attempt - 1);
                log::warn!(
                    "[Retry] {} failed (attempt {}/{}): {}. Retrying in {}ms",
                    label,
                    attempt,
                    max_attempts,
                    err,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
