//! Polling wait primitive
//!
//! Boot completion has no hard timeout (slow boots are legal, the operator
//! can interrupt); console-fingerprint retrieval is bounded because console
//! output that never contains a fingerprint is a genuine failure.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Poll `probe` every `poll_interval` until it yields `Some(value)`.
///
/// With `max_wait` set, elapsing the deadline fails with
/// [`Error::WaitTimeout`]. Probe errors propagate immediately.
pub async fn wait_until<T, F, Fut>(
    what: &str,
    poll_interval: Duration,
    max_wait: Option<Duration>,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    info!("waiting for {what}");
    loop {
        if let Some(value) = probe().await? {
            info!("{what}: ready after {}s", start.elapsed().as_secs());
            return Ok(value);
        }
        let waited = start.elapsed();
        if let Some(max) = max_wait {
            if waited >= max {
                return Err(Error::WaitTimeout {
                    what: what.to_string(),
                    waited_secs: waited.as_secs(),
                });
            }
        }
        debug!("still waiting for {what} ({}s elapsed)", waited.as_secs());
        tokio::time::sleep(poll_interval).await;
    }
}
