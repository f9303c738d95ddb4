//! Backoff helpers for callers that choose to retry transient failures.
//!
//! The dispatch engine never retries an ask on its own; these helpers are for
//! the shell (re-asking after `RateLimited`/`NetworkFailure`) and for
//! idempotent setup calls inside a transport.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const RETRY_INITIAL_DELAY: u64 = 2000;
pub const RETRY_BACKOFF_FACTOR: u64 = 2;
pub const RETRY_MAX_DELAY_NO_HEADERS: u64 = 30_000;
pub const RETRY_MAX_DELAY: u64 = 2_147_483_647;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: u64,
    pub backoff_factor: u64,
    pub max_delay_no_headers: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: RETRY_INITIAL_DELAY,
            backoff_factor: RETRY_BACKOFF_FACTOR,
            max_delay_no_headers: RETRY_MAX_DELAY_NO_HEADERS,
        }
    }
}

impl RetryConfig {
    fn backoff(&self, attempt: u32) -> u64 {
        exponential_backoff(
            attempt,
            self.initial_delay,
            self.backoff_factor,
            self.max_delay_no_headers,
        )
    }
}

/// Return `Some(reason)` when the error is worth another attempt.
pub trait IsRetryable {
    fn is_retryable(&self) -> Option<String>;
}

/// Delay in milliseconds before retry number `attempt` (1-based).
///
/// `retry-after-ms` wins, then `retry-after` (seconds or HTTP date), then
/// exponential backoff capped at 30s when no headers were seen.
pub fn delay(attempt: u32, response_headers: Option<&HashMap<String, String>>) -> u64 {
    let Some(headers) = response_headers else {
        return exponential_backoff(
            attempt,
            RETRY_INITIAL_DELAY,
            RETRY_BACKOFF_FACTOR,
            RETRY_MAX_DELAY_NO_HEADERS,
        );
    };

    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
    {
        return (ms as u64).min(RETRY_MAX_DELAY);
    }

    if let Some(value) = headers.get("retry-after") {
        if let Some(secs) = value.parse::<f64>().ok().filter(|v| v.is_finite()) {
            return ((secs * 1000.0).ceil() as u64).min(RETRY_MAX_DELAY);
        }
        if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
            let diff_ms = date
                .signed_duration_since(chrono::Utc::now())
                .num_milliseconds();
            if diff_ms > 0 {
                return diff_ms as u64;
            }
        }
    }

    exponential_backoff(attempt, RETRY_INITIAL_DELAY, RETRY_BACKOFF_FACTOR, RETRY_MAX_DELAY)
}

fn exponential_backoff(attempt: u32, initial: u64, factor: u64, max: u64) -> u64 {
    let exp = factor.saturating_pow(attempt.saturating_sub(1));
    initial.saturating_mul(exp).min(max)
}

/// Runs `f` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or `cancel` fires. On cancellation the last error is returned.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= config.max_attempts {
            return Err(err);
        }
        let Some(reason) = err.is_retryable() else {
            return Err(err);
        };

        let delay_ms = config.backoff(attempt);
        warn!(
            attempt,
            max = config.max_attempts,
            delay_ms,
            reason = %reason,
            "retrying after transient error"
        );

        let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = sleep => {}
                    _ = token.cancelled() => return Err(err),
                }
            }
            None => sleep.await,
        }
    }
}
