//! Bounded polling
//!
//! Used where the remote side converges asynchronously: a load balancer
//! getting an address, a bucket deletion propagating. Each wait has a fixed
//! ceiling and a fixed interval, and expiry is [`Error::DeadlineExceeded`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Ceiling for load balancer address assignment
pub const LOAD_BALANCER_TIMEOUT: Duration = Duration::from_secs(600);

/// Interval between load balancer polls
pub const LOAD_BALANCER_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Ceiling for bucket deletion to propagate
pub const BUCKET_DELETION_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between bucket existence polls
pub const BUCKET_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Poll until `check` yields a value, the ceiling passes, or `cancel` fires
///
/// `check` returns `Ok(Some(v))` when done and `Ok(None)` to keep waiting.
/// Retryable errors are logged and polling continues; anything else is
/// returned immediately.
pub async fn wait_for<T, F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("waiting for {}", what)));
        }

        match check().await {
            Ok(Some(value)) => {
                debug!(what, "condition met");
                return Ok(value);
            }
            Ok(None) => trace!(what, "condition not yet met"),
            Err(e) if e.is_retryable() => trace!(what, error = %e, "poll check failed, retrying"),
            Err(e) => return Err(e),
        }

        if Instant::now() + interval > deadline {
            return Err(Error::deadline_exceeded(what, timeout));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!("waiting for {}", what)));
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// [`wait_for`] over a boolean condition
pub async fn poll_until<F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    wait_for(what, timeout, interval, cancel, || {
        let fut = check();
        async move { fut.await.map(|done| done.then_some(())) }
    })
    .await
}
