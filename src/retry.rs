//! Bounded retry with explicit backoff
//!
//! An explicit loop taking (operation, max attempts, backoff function)
//! instead of retry-via-rescue; callers decide which errors are worth
//! retrying.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// `min(2^attempt, cap)` seconds, attempt starting at 1
pub fn exponential_backoff(cap_secs: u64) -> impl Fn(u32) -> Duration {
    move |attempt| Duration::from_secs(2u64.saturating_pow(attempt).min(cap_secs))
}

/// Run `op` up to `max_attempts` times, sleeping `backoff(attempt)` between
/// tries. Errors rejected by `should_retry`, and the final error, propagate
/// unchanged.
pub async fn retry_with_backoff<T, F, Fut, B, P>(
    what: &str,
    max_attempts: u32,
    backoff: B,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    B: Fn(u32) -> Duration,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                let delay = backoff(attempt);
                warn!(
                    "{what}: attempt {attempt}/{max_attempts} failed ({e}), \
                     retrying in {}s",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
