//! Caller-visible delivery timeouts.
//!
//! [`settle_within`] races a completion signal against a timer. When the
//! timer wins, only the caller's side is cancelled: the supplied expiry hook
//! removes whatever bookkeeping still refers to the message, and the future
//! resolves with [`PublishError::Timeout`]. A handoff that was already issued
//! to a channel is never retracted.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::{log_debug, PublishError, Result};

/// Wait for `completion`, giving up after `limit` if one is given.
///
/// `on_expiry` runs exactly once, only when the timer fires first. It returns
/// whether it still found (and removed) the pending entry. That only affects
/// logging: an expired wait always reports a timeout.
///
/// A completion sender dropped without settling is reported as
/// [`PublishError::Closed`].
pub(crate) async fn settle_within<T, F>(
    completion: oneshot::Receiver<Result<T>>,
    limit: Option<Duration>,
    on_expiry: F,
) -> Result<T>
where
    F: FnOnce() -> bool,
{
    // ---
    let Some(limit) = limit else {
        return completion.await.unwrap_or(Err(PublishError::Closed));
    };

    match tokio::time::timeout(limit, completion).await {
        Ok(settled) => settled.unwrap_or(Err(PublishError::Closed)),
        Err(_) => {
            if !on_expiry() {
                log_debug!("delivery wait expired after {limit:?}, entry already handed off");
            }
            Err(PublishError::Timeout(limit))
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_completion_before_timer() {
        // ---
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(7)).unwrap();

        let mut expired = false;
        let result = settle_within(rx, Some(Duration::from_millis(50)), || {
            expired = true;
            true
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert!(!expired);
    }

    #[tokio::test]
    async fn test_timer_fires_and_runs_expiry_once() {
        // ---
        let (_tx, rx) = oneshot::channel::<Result<()>>();
        let mut calls = 0;
        let start = Instant::now();

        let result = settle_within(rx, Some(Duration::from_millis(20)), || {
            calls += 1;
            true
        })
        .await;

        assert!(matches!(result, Err(PublishError::Timeout(d)) if d == Duration::from_millis(20)));
        assert_eq!(calls, 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_timeout_reported_even_if_entry_already_handed_off() {
        // ---
        let (_tx, rx) = oneshot::channel::<Result<()>>();

        let result = settle_within(rx, Some(Duration::from_millis(5)), || false).await;

        assert!(matches!(result, Err(PublishError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_closed() {
        // ---
        let (tx, rx) = oneshot::channel::<Result<()>>();
        drop(tx);

        let result = settle_within(rx, None, || unreachable!()).await;

        assert!(matches!(result, Err(PublishError::Closed)));
    }
}
