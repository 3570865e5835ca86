//! Retry with exponential backoff for transient retrieval failures.

use std::future::Future;
use std::time::Duration;

use crate::error::RetrievalError;

pub use crate::config::RetryPolicy;

/// Execute `operation` with retry on transient failures.
///
/// Retries on `RetrievalError::RateLimited` (respects `retry_after_secs`),
/// `RetrievalError::Server`, `RetrievalError::Connection`, and
/// `RetrievalError::Timeout`. Permanent errors (auth, parse) return
/// immediately.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, RetrievalError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, RetrievalError>>,
{
    let mut last_err = None;
    for attempt in 0..=policy.max_retries {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt == policy.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(policy, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RetrievalError::Connection {
        message: "All retry attempts exhausted".to_string(),
    }))
}

/// Check if an error is retryable (transient).
pub(crate) fn is_retryable(err: &RetrievalError) -> bool {
    matches!(
        err,
        RetrievalError::RateLimited { .. }
            | RetrievalError::Server { .. }
            | RetrievalError::Connection { .. }
            | RetrievalError::Timeout { .. }
    )
}

/// Compute backoff delay, respecting rate limit retry-after headers.
fn compute_backoff(policy: &RetryPolicy, attempt: u32, err: &RetrievalError) -> u64 {
    // For rate limiting, respect the server's retry-after if present
    if let RetrievalError::RateLimited { retry_after_secs } = err {
        let server_ms = retry_after_secs.saturating_mul(1000);
        let computed = compute_exponential_backoff(policy, attempt);
        return server_ms.max(computed);
    }
    compute_exponential_backoff(policy, attempt)
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let base = policy.initial_backoff_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(policy.max_backoff_ms as f64);
    if policy.jitter {
        // Spread the delay by up to ±25% so retries decorrelate
        let offset = capped * 0.25 * (2.0 * rand_simple() - 1.0);
        (capped + offset) as u64
    } else {
        capped as u64
    }
}

/// Simple deterministic pseudo-random for jitter (avoids pulling in rand crate).
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
