//! Async test helpers
//!
//! Timeouts and snapshot waits for tests that drive the reconciler and the
//! session bootstrap.

use crate::membership::{Snapshot, SnapshotWatch};
use crate::session::IdentityWatch;
use crate::model::AuthState;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Default wait used by the helpers below
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Run a future with a timeout, returning Ok(result) or Err on timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    Elapsed,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimeoutError {}

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Helper to assert a future does NOT complete within duration
pub async fn assert_times_out<F, T>(duration: Duration, future: F)
where
    F: Future<Output = T>,
{
    if timeout(duration, future).await.is_ok() {
        panic!("Expected future to time out, but it completed within {:?}", duration);
    }
}

/// Wait until a published snapshot satisfies `predicate`
pub async fn wait_for_snapshot(
    watch: &mut SnapshotWatch,
    predicate: impl FnMut(&Snapshot) -> bool,
) -> Arc<Snapshot> {
    assert_completes_within(DEFAULT_WAIT, watch.wait_for(predicate))
        .await
        .expect("reconciler stopped while waiting for a snapshot")
}

/// Wait until the identity signal satisfies `predicate`
pub async fn wait_for_identity(
    watch: &mut IdentityWatch,
    mut predicate: impl FnMut(&AuthState) -> bool,
) -> AuthState {
    assert_completes_within(DEFAULT_WAIT, async {
        loop {
            let current = watch.current();
            if predicate(&current) {
                return current;
            }
            watch
                .changed()
                .await
                .expect("identity signal closed while waiting");
        }
    })
    .await
}

/// Let every ready task run to its next await point
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;
        assert_eq!(result, Err(TimeoutError::Elapsed));
    }

    #[tokio::test]
    async fn test_assert_times_out() {
        assert_times_out(Duration::from_millis(10), std::future::pending::<()>()).await;
    }
}
