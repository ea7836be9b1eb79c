//! Cancellation helpers.
//!
//! Every bucket operation takes a [`CancellationToken`]. Cancelling it, or any of its
//! parents, aborts in-flight work and releases the backend sessions it holds.

use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::error::{BucketError, Result};

/// Derive a token that is cancelled with `parent` or once `timeout` elapses.
pub fn with_timeout(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let deadline = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = deadline.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!("Deadline of {:?} reached, cancelling", timeout);
                deadline.cancel();
            }
        }
    });
    token
}

pub(crate) fn ensure_active(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        Err(BucketError::Canceled)
    } else {
        Ok(())
    }
}

/// Drive `work` until it finishes or `ctx` is cancelled, dropping it in the latter case.
pub(crate) async fn run_cancellable<T, F>(ctx: &CancellationToken, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(BucketError::Canceled),
        result = work => result,
    }
}
