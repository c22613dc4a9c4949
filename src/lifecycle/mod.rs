//! Channel lifecycle supervision.
//!
//! [`ChannelLifecycle`] turns a [`ConnectionSupplier`](crate::ConnectionSupplier)
//! into a continuously retried sequence of channels. Subscribers see one
//! [`LifecycleEvent::Opened`] per channel and one [`LifecycleEvent::Closed`]
//! per failed or completed attempt, then the next attempt starts on its own.
//!
//! ## Concurrency model
//!
//! - Nothing runs until [`ChannelLifecycle::subscribe`] is called.
//! - A single supervisor task owns every attempt. An attempt requests a
//!   connection, invokes `on_opened`, opens a channel and then waits for the
//!   first terminal signal (see the `attempt` module for how the four raw
//!   signals collapse into one outcome).
//! - Every failure, and every clean completion, restarts the full sequence:
//!   new connection request, new channel, new listeners. There is no retry
//!   limit. The delay between attempts comes from [`RetryConfig`] and is zero
//!   by default.
//! - Cleanup for an attempt (listener removal, deferred-close cancellation,
//!   `on_closed`) runs exactly once, whichever signal or unsubscribe ends it.
//!
//! ## Cancellation
//!
//! [`LifecycleSubscription::unsubscribe`], any [`CancelHandle`], or dropping
//! the subscription stops the supervisor. The attempt in progress is cleaned
//! up and no terminal outcome is reported for it.

mod attempt;
mod cleanup;

pub use attempt::AttemptState;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::retry::Backoff;
use crate::{
    //
    log_debug,
    log_info,
    log_warn,
    ChannelPtr,
    PublishError,
    RetryConfig,
    SupplierPtr,
};

use attempt::{AttemptContext, AttemptOutcome};

/// Default window during which a connection error may override a channel
/// close that was reported first.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(10);

/// Telemetry callback invoked by the lifecycle.
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Caller-supplied `on_opened` / `on_closed` hooks.
///
/// `on_opened` fires once a connection has been acquired; `on_closed` fires
/// exactly once during that attempt's cleanup.
#[derive(Clone)]
pub struct LifecycleHooks {
    pub on_opened: Hook,
    pub on_closed: Hook,
}

impl LifecycleHooks {
    pub fn new<O, C>(on_opened: O, on_closed: C) -> Self
    where
        O: Fn() + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        Self {
            on_opened: Arc::new(on_opened),
            on_closed: Arc::new(on_closed),
        }
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new(|| {}, || {})
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks").finish_non_exhaustive()
    }
}

/// Notification delivered to a lifecycle subscriber.
#[derive(Clone)]
pub enum LifecycleEvent {
    /// A new channel is ready. It stays valid until the next `Closed`.
    Opened(ChannelPtr),

    /// The current attempt ended: `None` for a clean completion, `Some` with
    /// the collapsed terminal error otherwise. A new attempt follows.
    Closed(Option<PublishError>),
}

impl fmt::Debug for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Opened(_) => f.write_str("Opened(..)"),
            LifecycleEvent::Closed(outcome) => f.debug_tuple("Closed").field(outcome).finish(),
        }
    }
}

/// Continuously retried source of broker channels.
///
/// # Example
///
/// ```no_run
/// use mom_publisher::{ChannelLifecycle, LifecycleEvent, LifecycleHooks, MemoryBroker};
///
/// # async fn example() {
/// let broker = MemoryBroker::new();
/// let mut subscription = ChannelLifecycle::new(broker.supplier())
///     .hooks(LifecycleHooks::new(|| println!("up"), || println!("down")))
///     .subscribe();
///
/// while let Some(event) = subscription.next().await {
///     match event {
///         LifecycleEvent::Opened(_channel) => { /* use it */ }
///         LifecycleEvent::Closed(err) => println!("lost channel: {err:?}"),
///     }
/// }
/// # }
/// ```
pub struct ChannelLifecycle {
    supplier: SupplierPtr,
    hooks: LifecycleHooks,
    close_grace: Duration,
    retry: RetryConfig,
}

impl ChannelLifecycle {
    pub fn new(supplier: SupplierPtr) -> Self {
        Self {
            supplier,
            hooks: LifecycleHooks::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
            retry: RetryConfig::default(),
        }
    }

    /// Set the `on_opened` / `on_closed` telemetry hooks.
    pub fn hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set how long a channel close waits for a competing connection error.
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Set the delay policy between attempts.
    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Start the supervisor and return the subscription that receives its
    /// events. Must be called from within a Tokio runtime.
    pub fn subscribe(self) -> LifecycleSubscription {
        // ---
        let (events_tx, events_rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        tokio::spawn(self.supervise(events_tx, cancel_rx));

        LifecycleSubscription {
            events: events_rx,
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
            },
        }
    }

    async fn supervise(
        self,
        events: mpsc::Sender<LifecycleEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        // ---
        let ctx = AttemptContext {
            supplier: self.supplier,
            hooks: self.hooks,
            close_grace: self.close_grace,
        };
        let mut backoff = Backoff::new(self.retry);
        let mut number = 0u64;

        loop {
            number += 1;
            let report = attempt::run(&ctx, number, &events, &mut cancel).await;

            let closed = match report.outcome {
                AttemptOutcome::Cancelled => break,
                AttemptOutcome::Completed => {
                    log_info!("attempt {number} completed cleanly, reconnecting");
                    LifecycleEvent::Closed(None)
                }
                AttemptOutcome::Failed(err) => {
                    log_warn!("attempt {number} failed: {err}, reconnecting");
                    LifecycleEvent::Closed(Some(err))
                }
            };

            let delivered = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => false,
                sent = events.send(closed) => sent.is_ok(),
            };
            if !delivered {
                break;
            }

            if report.opened {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            log_debug!("waiting {delay:?} before attempt {}", number + 1);
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log_debug!("lifecycle supervisor stopped after {number} attempts");
    }
}

/// Resolves once the subscription is cancelled or every handle is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

/// Receiving end of a [`ChannelLifecycle`].
///
/// Dropping the subscription unsubscribes.
pub struct LifecycleSubscription {
    events: mpsc::Receiver<LifecycleEvent>,
    cancel: CancelHandle,
}

impl LifecycleSubscription {
    /// Next lifecycle event, or `None` once the supervisor has stopped.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        self.events.recv().await
    }

    /// Stop the supervisor. The attempt in progress is cleaned up without
    /// reporting an outcome.
    pub fn unsubscribe(&self) {
        self.cancel.unsubscribe();
    }

    /// A cloneable handle that can unsubscribe from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Drop for LifecycleSubscription {
    fn drop(&mut self) {
        self.cancel.unsubscribe();
    }
}

/// Cloneable cancellation handle for a [`LifecycleSubscription`].
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn unsubscribe(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}
