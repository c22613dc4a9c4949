//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! broker collaborators ([`ConnectionSupplier`], [`BrokerConnection`],
//! [`BrokerChannel`]). It is intended primarily for testing, local execution,
//! and as a reference for collaborator semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker establishes the following expectations, which other
//! collaborator implementations should approximate:
//!
//! - `send_to_queue()` on an open, unsaturated channel accepts the payload
//!   immediately and returns `true`.
//! - A saturated channel refuses the payload and returns `false`; it emits
//!   [`ChannelEvent::Drain`] once it accepts writes again.
//! - A closed or errored channel answers every operation with
//!   [`PublishError::IllegalOperation`] and is never reused.
//! - `check_queue()` fails for undeclared queues.
//!
//! ## Fault injection
//!
//! Every failure the publisher has to survive can be triggered by hand:
//! refused or suspended connection requests, channel and connection close and
//! error notifications, backpressure, failed queue checks, and failed
//! handoffs.
//! [`MemoryConnection::crash`] reproduces the ordering real brokers exhibit,
//! where channels report a clean close before the connection reports the
//! error that caused it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::util::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    BrokerChannel,
    BrokerConnection,
    ChannelEvent,
    ChannelPtr,
    ConnectionEvent,
    ConnectionPtr,
    ConnectionSupplier,
    PublishError,
    Result,
    SendOptions,
    SupplierPtr,
};

const EVENT_CAPACITY: usize = 16;

/// A message accepted by an in-memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Bytes,
    pub persistent: bool,
}

/// Simulated broker shared by every connection it hands out.
///
/// Cheap to clone; all clones refer to the same queues and counters.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    available: watch::Sender<bool>,
    channels_opened: watch::Sender<usize>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Vec<Delivery>>,
    refuse_connections: usize,
    connections_opened: usize,
    current_connection: Option<Arc<MemoryConnection>>,
    current_channel: Option<Arc<MemoryChannel>>,
    queue_check_fault: Option<PublishError>,
    queue_checks: usize,
}

impl MemoryBroker {
    /// Create a new, empty broker that accepts connections.
    pub fn new() -> Self {
        // ---
        let (available, _) = watch::channel(true);
        let (channels_opened, _) = watch::channel(0);

        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                available,
                channels_opened,
            }),
        }
    }

    /// A connection supplier backed by this broker.
    pub fn supplier(&self) -> SupplierPtr {
        Arc::new(MemorySupplier {
            broker: self.clone(),
        })
    }

    /// Declare `queue` so that `check_queue()` succeeds and sends are kept.
    pub fn declare_queue(&self, queue: &str) {
        let mut state = lock_ignore_poison(&self.inner.state);
        state.queues.entry(queue.to_string()).or_default();
    }

    /// Remove `queue` and everything delivered to it.
    pub fn delete_queue(&self, queue: &str) {
        lock_ignore_poison(&self.inner.state).queues.remove(queue);
    }

    /// Messages accepted by `queue`, in arrival order.
    pub fn messages(&self, queue: &str) -> Vec<Delivery> {
        // ---
        lock_ignore_poison(&self.inner.state)
            .queues
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Payloads accepted by `queue`, in arrival order.
    pub fn payloads(&self, queue: &str) -> Vec<Bytes> {
        self.messages(queue).into_iter().map(|d| d.payload).collect()
    }

    /// While unavailable, connection requests suspend instead of failing.
    pub fn set_available(&self, available: bool) {
        self.inner.available.send_replace(available);
    }

    /// Refuse the next `count` connection requests with a connection error.
    pub fn refuse_next_connections(&self, count: usize) {
        lock_ignore_poison(&self.inner.state).refuse_connections = count;
    }

    /// Fail the next `check_queue()` on any channel with `err`.
    pub fn fail_next_queue_check(&self, err: PublishError) {
        lock_ignore_poison(&self.inner.state).queue_check_fault = Some(err);
    }

    /// Number of `check_queue()` calls answered so far, failed ones included.
    pub fn queue_checks(&self) -> usize {
        lock_ignore_poison(&self.inner.state).queue_checks
    }

    /// Number of connections handed out so far.
    pub fn connections_opened(&self) -> usize {
        lock_ignore_poison(&self.inner.state).connections_opened
    }

    /// Number of channels opened so far, on any connection.
    pub fn channels_opened(&self) -> usize {
        *self.inner.channels_opened.borrow()
    }

    /// Wait until at least `count` channels have been opened.
    pub async fn wait_for_channels(&self, count: usize) {
        let mut opened = self.inner.channels_opened.subscribe();
        let _ = opened.wait_for(|opened| *opened >= count).await;
    }

    /// The most recently handed-out connection.
    pub fn current_connection(&self) -> Option<Arc<MemoryConnection>> {
        lock_ignore_poison(&self.inner.state).current_connection.clone()
    }

    /// The most recently opened channel.
    pub fn current_channel(&self) -> Option<Arc<MemoryChannel>> {
        lock_ignore_poison(&self.inner.state).current_channel.clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerInner {
    fn store(&self, queue: &str, delivery: Delivery) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        match state.queues.get_mut(queue) {
            Some(messages) => messages.push(delivery),
            None => {
                log_debug!("memory broker: dropping message for undeclared queue {queue}");
            }
        }
    }

    fn check_queue(&self, queue: &str) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.queue_checks += 1;

        if let Some(err) = state.queue_check_fault.take() {
            return Err(err);
        }
        if !state.queues.contains_key(queue) {
            return Err(PublishError::QueueCheck {
                queue: queue.to_string(),
                reason: format!("NOT_FOUND - no queue '{queue}'"),
            });
        }
        Ok(())
    }
}

struct MemorySupplier {
    broker: MemoryBroker,
}

#[async_trait::async_trait]
impl ConnectionSupplier for MemorySupplier {
    // ---
    async fn get_connection(&self) -> Result<ConnectionPtr> {
        // ---
        let inner = &self.broker.inner;
        let mut available = inner.available.subscribe();
        let _ = available.wait_for(|available| *available).await;

        let mut state = lock_ignore_poison(&inner.state);
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(PublishError::Connection("connection refused".into()));
        }

        state.connections_opened += 1;
        let connection = Arc::new(MemoryConnection {
            id: state.connections_opened,
            broker: Arc::downgrade(inner),
            events: broadcast::channel(EVENT_CAPACITY).0,
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        });
        state.current_connection = Some(Arc::clone(&connection));

        log_info!("memory broker: connection {} opened", connection.id);
        Ok(connection)
    }
}

/// Connection handed out by [`MemoryBroker`].
pub struct MemoryConnection {
    id: usize,
    broker: Weak<BrokerInner>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    /// Sequence number of this connection, starting at 1.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Emit a connection error notification.
    pub fn emit_error(&self, err: PublishError) {
        let _ = self.events.send(ConnectionEvent::Error(err));
    }

    /// Close the connection and invalidate its channels. Only the connection
    /// emits a notification.
    pub fn emit_close(&self, cause: Option<PublishError>) {
        // ---
        self.closed.store(true, Ordering::SeqCst);
        for channel in lock_ignore_poison(&self.channels).iter() {
            channel.closed.store(true, Ordering::SeqCst);
        }
        let _ = self.events.send(ConnectionEvent::Close(cause));
    }

    /// Simulate a broker-side failure: every channel reports a clean close
    /// first, then the connection reports the real cause.
    pub fn crash(&self, cause: PublishError) {
        // ---
        for channel in lock_ignore_poison(&self.channels).iter() {
            channel.emit_close(None);
        }
        self.emit_error(cause.clone());
        self.emit_close(Some(cause));
    }
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    // ---
    async fn create_channel(&self) -> Result<ChannelPtr> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::IllegalOperation("connection closed".into()));
        }
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| PublishError::Connection("broker shut down".into()))?;

        let channel = Arc::new(MemoryChannel {
            connection_id: self.id,
            broker: Arc::downgrade(&broker),
            events: broadcast::channel(EVENT_CAPACITY).0,
            closed: AtomicBool::new(false),
            saturated: AtomicBool::new(false),
            poisoned: Mutex::new(None),
            send_attempts: AtomicUsize::new(0),
        });
        lock_ignore_poison(&self.channels).push(Arc::clone(&channel));
        lock_ignore_poison(&broker.state).current_channel = Some(Arc::clone(&channel));
        broker.channels_opened.send_modify(|opened| *opened += 1);

        log_debug!("memory broker: channel opened on connection {}", self.id);
        Ok(channel)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

/// Channel handed out by [`MemoryConnection`].
pub struct MemoryChannel {
    connection_id: usize,
    broker: Weak<BrokerInner>,
    events: broadcast::Sender<ChannelEvent>,
    closed: AtomicBool,
    saturated: AtomicBool,
    poisoned: Mutex<Option<PublishError>>,
    send_attempts: AtomicUsize,
}

impl MemoryChannel {
    /// Id of the connection this channel belongs to.
    pub fn connection_id(&self) -> usize {
        self.connection_id
    }

    /// Number of `send_to_queue()` calls, accepted or not.
    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// While saturated, sends are refused with `false`.
    pub fn set_saturated(&self, saturated: bool) {
        self.saturated.store(saturated, Ordering::SeqCst);
    }

    /// Clear saturation and emit a drain notification.
    pub fn drain(&self) {
        self.saturated.store(false, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Drain);
    }

    /// Make the next send fail with `err`.
    pub fn fail_next_send(&self, err: PublishError) {
        *lock_ignore_poison(&self.poisoned) = Some(err);
    }

    /// Invalidate the channel and emit a close notification.
    pub fn emit_close(&self, cause: Option<PublishError>) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Close(cause));
    }

    /// Invalidate the channel and emit an error notification.
    pub fn emit_error(&self, err: PublishError) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Error(err));
    }

    /// Close cleanly.
    pub fn close(&self) {
        self.emit_close(None);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PublishError::IllegalOperation("channel closed".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    // ---
    async fn check_queue(&self, queue: &str) -> Result<()> {
        // ---
        self.ensure_open()?;

        match self.broker.upgrade() {
            Some(broker) => broker.check_queue(queue),
            None => Err(PublishError::IllegalOperation("memory: broker dropped".into())),
        }
    }

    fn send_to_queue(&self, queue: &str, payload: Bytes, opts: SendOptions) -> Result<bool> {
        // ---
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;

        if let Some(err) = lock_ignore_poison(&self.poisoned).take() {
            return Err(err);
        }
        if self.saturated.load(Ordering::SeqCst) {
            return Ok(false);
        }

        if let Some(broker) = self.broker.upgrade() {
            broker.store(
                queue,
                Delivery {
                    payload,
                    persistent: opts.persistent,
                },
            );
        }
        Ok(true)
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
