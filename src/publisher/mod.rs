//! Backpressured delivery queue.
//!
//! [`Publisher`] buffers outbound payloads in a bounded FIFO and hands them,
//! strictly in order, to whichever channel the [`ChannelLifecycle`] currently
//! provides.
//!
//! ## Concurrency model
//!
//! - A channel-tracking task consumes the lifecycle subscription. Every
//!   opened channel is validated (the destination queue must exist) before
//!   it becomes current; every closed attempt clears the current channel, so
//!   a delivery loop waiting for a channel never picks up a dead one.
//! - At most one delivery loop runs at a time. It is spawned by `publish()`
//!   when idle and exits once the queue is empty or the publisher closes.
//! - The queue, the `closed` flag and the loop's running flag share one
//!   mutex that is never held across an await. Handing the head entry to the
//!   channel and removing it happen under that lock, as does removing an
//!   entry whose timeout fired, so an entry is settled at most once.
//!
//! ## Handoff outcomes
//!
//! - accepted: the head is resolved and removed,
//! - saturated: the head stays put until the channel drains,
//! - [`IllegalOperation`](crate::PublishError::IllegalOperation): the head
//!   stays put and the loop retries on the next current channel,
//! - anything else: unrecoverable, escalated through
//!   [`Publisher::wait_fatal`] and the publisher closes itself.

mod pending;

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot, watch};

use crate::timeout_guard::settle_within;
use crate::util::lock_ignore_poison;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    ChannelEvent,
    ChannelLifecycle,
    ChannelPtr,
    CancelHandle,
    LifecycleEvent,
    LifecycleHooks,
    LifecycleSubscription,
    MessageId,
    PublishError,
    PublisherBuilder,
    PublisherOptions,
    Result,
    SendOptions,
    SupplierPtr,
};

use pending::{PendingEntry, PendingQueue};

/// Upper bound on how long the loop waits for a replacement channel after a
/// transient handoff failure before trying again.
const TRANSIENT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Reliable publisher for a single destination queue.
///
/// Cheap to clone; all clones share the same queue and channel.
///
/// # Example
///
/// ```no_run
/// use mom_publisher::{MemoryBroker, Publisher};
/// use std::time::Duration;
///
/// # async fn example() -> mom_publisher::Result<()> {
/// let broker = MemoryBroker::new();
/// broker.declare_queue("jobs");
///
/// let publisher = Publisher::builder(broker.supplier())
///     .queue_name("jobs")
///     .maximum_in_memory_queue_size(500)
///     .build()?;
///
/// publisher.publish(&b"hello"[..]).await?;
/// publisher
///     .publish_with_timeout(&b"world"[..], Duration::from_secs(1))
///     .await?;
///
/// publisher.close_publisher();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

struct Inner {
    queue_name: String,
    send_options: SendOptions,
    state: std::sync::Mutex<QueueState>,
    current: watch::Sender<Option<ChannelPtr>>,
    shutdown: watch::Sender<bool>,
    fatal: watch::Sender<Option<PublishError>>,
    lifecycle: CancelHandle,
}

struct QueueState {
    pending: PendingQueue,
    closed: bool,
    delivering: bool,
}

enum Handoff {
    Idle,
    Delivered,
    Saturated,
    Transient(PublishError),
    Fatal(PublishError),
}

impl Publisher {
    /// Start a fluent [`PublisherBuilder`].
    pub fn builder(supplier: SupplierPtr) -> PublisherBuilder {
        PublisherBuilder::new(supplier)
    }

    /// Create a publisher and subscribe it to a new channel lifecycle.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::MissingConfig`] or
    /// [`PublishError::InvalidConfig`] for unusable options. Broker
    /// availability is not checked here.
    pub fn create(
        supplier: SupplierPtr,
        hooks: LifecycleHooks,
        options: PublisherOptions,
    ) -> Result<Self> {
        // ---
        options.validate()?;

        let subscription = ChannelLifecycle::new(supplier)
            .hooks(hooks)
            .close_grace(options.close_grace)
            .retry_config(options.retry.clone())
            .subscribe();

        let inner = Arc::new(Inner {
            queue_name: options.queue_name.clone(),
            send_options: options.send_options(),
            state: std::sync::Mutex::new(QueueState {
                pending: PendingQueue::new(options.maximum_in_memory_queue_size),
                closed: false,
                delivering: false,
            }),
            current: watch::channel(None).0,
            shutdown: watch::channel(false).0,
            fatal: watch::channel(None).0,
            lifecycle: subscription.cancel_handle(),
        });

        tokio::spawn(track_channels(Arc::downgrade(&inner), subscription));

        log_info!("publisher for queue {} created", options.queue_name);
        Ok(Self { inner })
    }

    /// Queue `payload` and wait until a channel accepts it.
    ///
    /// # Errors
    ///
    /// - [`PublishError::QueueFull`] if the in-memory queue is at capacity
    /// - [`PublishError::Closed`] if the publisher has been closed, or closes
    ///   before the message is handed off
    pub async fn publish(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_inner(payload.into(), None).await
    }

    /// Like [`publish`](Self::publish), but give up after `timeout`.
    ///
    /// On expiry a still-queued message is removed and never sent. A message
    /// already handed to a channel may still reach the broker even though
    /// this call reports [`PublishError::Timeout`]. A zero `timeout` means no
    /// timeout.
    pub async fn publish_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<()> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        self.publish_inner(payload.into(), timeout).await
    }

    async fn publish_inner(&self, payload: Bytes, timeout: Option<Duration>) -> Result<()> {
        // ---
        let (id, completion) = self.inner.enqueue(payload)?;

        let inner = &self.inner;
        settle_within(completion, timeout, || inner.remove_queued(id)).await
    }

    /// Close the publisher.
    ///
    /// Later `publish()` calls fail with [`PublishError::Closed`], every
    /// entry still queued is rejected with `Closed`, and the channel
    /// lifecycle is unsubscribed. Calling it again has no effect.
    pub fn close_publisher(&self) {
        self.inner.close();
    }

    /// Whether `close_publisher()` ran, directly or after a fatal error.
    pub fn is_closed(&self) -> bool {
        lock_ignore_poison(&self.inner.state).closed
    }

    /// Number of messages waiting for a channel.
    pub fn queue_len(&self) -> usize {
        lock_ignore_poison(&self.inner.state).pending.len()
    }

    /// Destination queue every message is sent to.
    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// The unrecoverable error that shut this publisher down, if any.
    pub fn fatal_error(&self) -> Option<PublishError> {
        self.inner.fatal.borrow().clone()
    }

    /// Wait for an unrecoverable error.
    ///
    /// Intended for the owner that decides what a dead publisher means for
    /// the process. Never resolves if no such error occurs.
    pub async fn wait_fatal(&self) -> PublishError {
        // ---
        let mut fatal = self.inner.fatal.subscribe();
        loop {
            let current = fatal.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if fatal.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Inner {
    fn enqueue(
        self: &Arc<Self>,
        payload: Bytes,
    ) -> Result<(MessageId, oneshot::Receiver<Result<()>>)> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.pending.is_full() {
            return Err(PublishError::QueueFull(state.pending.capacity()));
        }
        if state.closed {
            return Err(PublishError::Closed);
        }

        let (entry, completion) = PendingEntry::new(payload);
        let id = entry.id;
        state.pending.push_back(entry);

        if !state.delivering {
            state.delivering = true;
            tokio::spawn(deliver(Arc::clone(self)));
        }

        Ok((id, completion))
    }

    /// Remove an entry whose timeout fired. Returns false if it had already
    /// been handed off (or rejected by close).
    fn remove_queued(&self, id: MessageId) -> bool {
        // ---
        let removed = lock_ignore_poison(&self.state).pending.remove(id);
        match removed {
            Some(_entry) => {
                log_debug!("message {id} timed out while queued, removed");
                true
            }
            None => false,
        }
    }

    /// Hand the head entry to `channel`, removing it on acceptance.
    fn hand_off_head(&self, channel: &ChannelPtr) -> Handoff {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let payload = match state.pending.head() {
            Some(head) if !state.closed => head.payload.clone(),
            _ => {
                state.delivering = false;
                return Handoff::Idle;
            }
        };

        match channel.send_to_queue(&self.queue_name, payload, self.send_options) {
            Ok(true) => {
                state.pending.complete_head();
                Handoff::Delivered
            }
            Ok(false) => Handoff::Saturated,
            Err(err) if err.is_transient() => Handoff::Transient(err),
            Err(err) => Handoff::Fatal(err),
        }
    }

    /// Wait for a validated channel. `None` once the publisher shuts down.
    async fn current_channel(&self) -> Option<ChannelPtr> {
        // ---
        let mut current = self.current.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => None,
            channel = current.wait_for(Option::is_some) => {
                channel.ok().and_then(|channel| channel.clone())
            }
        }
    }

    /// Suspend after a saturated handoff until `channel` drains, fails, or
    /// stops being current.
    async fn wait_for_drain(
        &self,
        channel: &ChannelPtr,
        events: &mut broadcast::Receiver<ChannelEvent>,
    ) {
        // ---
        let mut current = self.current.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        log_debug!("queue {}: channel saturated, waiting for drain", self.queue_name);

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => {}
            _ = current.wait_for(|c| !is_current(c, channel)) => {}
            event = events.recv() => match event {
                Ok(ChannelEvent::Drain) => {
                    log_debug!("queue {}: channel drained", self.queue_name);
                }
                Ok(ChannelEvent::Close(_) | ChannelEvent::Error(_)) => {
                    log_debug!("queue {}: channel failed while saturated", self.queue_name);
                }
                Err(_) => {}
            },
        }
    }

    /// After a transient failure, give the lifecycle a moment to replace
    /// `channel`.
    async fn wait_for_replacement(&self, channel: &ChannelPtr) {
        // ---
        let mut current = self.current.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => {}
            _ = current.wait_for(|c| !is_current(c, channel)) => {}
            _ = tokio::time::sleep(TRANSIENT_RETRY_INTERVAL) => {}
        }
    }

    /// Validate a freshly opened channel and make it current.
    ///
    /// Returns false when validation failed for good.
    async fn install(&self, channel: ChannelPtr) -> bool {
        // ---
        match channel.check_queue(&self.queue_name).await {
            Ok(()) => {
                if *self.shutdown.borrow() {
                    return false;
                }
                log_info!("queue {}: channel validated", self.queue_name);
                self.current.send_replace(Some(channel));
                true
            }
            Err(err) if err.is_transient() => {
                log_warn!("queue {}: channel closed during validation: {err}", self.queue_name);
                true
            }
            Err(err) => {
                self.escalate(err);
                false
            }
        }
    }

    fn escalate(&self, err: PublishError) {
        // ---
        log_error!("queue {}: unrecoverable publisher failure: {err}", self.queue_name);

        self.fatal.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(err);
            true
        });
        self.close();
    }

    fn close(&self) {
        // ---
        let abandoned = {
            let mut state = lock_ignore_poison(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.drain_all()
        };

        self.shutdown.send_replace(true);
        self.lifecycle.unsubscribe();
        self.current.send_replace(None);

        log_info!(
            "queue {}: publisher closed, rejecting {} queued messages",
            self.queue_name,
            abandoned.len()
        );
        for entry in abandoned {
            entry.settle(Err(PublishError::Closed));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.lifecycle.unsubscribe();
    }
}

fn is_current(current: &Option<ChannelPtr>, channel: &ChannelPtr) -> bool {
    // ---
    current.as_ref().is_some_and(|c| {
        Arc::as_ptr(c) as *const () == Arc::as_ptr(channel) as *const ()
    })
}

/// Follow the lifecycle: validate each opened channel and clear the current
/// one whenever an attempt ends.
async fn track_channels(inner: Weak<Inner>, mut subscription: LifecycleSubscription) {
    // ---
    while let Some(event) = subscription.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            LifecycleEvent::Opened(channel) => {
                if !inner.install(channel).await {
                    break;
                }
            }
            LifecycleEvent::Closed(outcome) => {
                inner.current.send_replace(None);
                match outcome {
                    None => {
                        log_info!("queue {}: channel closed", inner.queue_name);
                    }
                    Some(err) => {
                        log_warn!("queue {}: channel lost: {err}", inner.queue_name);
                    }
                }
            }
        }
    }
    log_debug!("channel tracking stopped");
}

/// The delivery loop. Runs until the queue is empty or the publisher closes.
async fn deliver(inner: Arc<Inner>) {
    // ---
    log_debug!("queue {}: delivery loop started", inner.queue_name);

    loop {
        let Some(channel) = inner.current_channel().await else {
            break;
        };
        let mut events = channel.events();

        match inner.hand_off_head(&channel) {
            Handoff::Idle => {
                log_debug!("queue {}: delivery loop idle", inner.queue_name);
                return;
            }
            Handoff::Delivered => {}
            Handoff::Saturated => inner.wait_for_drain(&channel, &mut events).await,
            Handoff::Transient(err) => {
                log_debug!("queue {}: transient handoff failure: {err}", inner.queue_name);
                inner.wait_for_replacement(&channel).await;
            }
            Handoff::Fatal(err) => {
                inner.escalate(err);
                break;
            }
        }
    }

    lock_ignore_poison(&inner.state).delivering = false;
}
