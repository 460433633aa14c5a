use std::future::Future;

use tokio::time::sleep;
use tokio::time::timeout;
use tracing::warn;

use super::backoff::ExponentialBackoff;
use crate::BackoffPolicy;
use crate::Code;
use crate::Error;
use crate::Result;

/// Runs `task` until it succeeds, fails with a non-retryable code or runs out
/// of attempts. Each attempt is bounded by `policy.timeout_ms`.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: Future<Output = Result<P>>,
{
    let mut backoff = ExponentialBackoff::new(policy);
    let mut attempts = 0usize;
    loop {
        let delay = backoff.next_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        attempts += 1;

        let error = match timeout(policy.timeout(), task()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) => e,
            Err(_) => Error::status(
                Code::DeadlineExceeded,
                format!("attempt timed out after {:?}", policy.timeout()),
            ),
        };

        let exhausted = policy.max_retries != 0 && attempts >= policy.max_retries;
        if !error.code().is_retryable() || exhausted {
            warn!("task failed after {} attempt(s): {:?}", attempts, error);
            return Err(error);
        }
        warn!("attempt {} failed, retrying: {:?}", attempts, error);
    }
}
