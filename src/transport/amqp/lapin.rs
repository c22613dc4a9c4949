//! AMQP broker client implementation using `lapin`.
//!
//! This module provides implementations of the domain collaborator traits
//! backed by an AMQP 0-9-1 broker. Publishing follows an **actor-based
//! concurrency model** so that the synchronous, non-blocking
//! [`BrokerChannel::send_to_queue`] contract can sit on top of lapin's async
//! API.
//!
//! ## Concurrency model
//!
//! - Every opened channel gets a single background **actor task** that owns
//!   the outbound side of the lapin channel.
//! - `send_to_queue()` never awaits. It `try_send`s a publish command into a
//!   small bounded mailbox:
//!   - accepted: reports `true`,
//!   - mailbox full: marks the channel saturated and reports `false`,
//!   - actor gone or channel failed: reports `IllegalOperation`.
//! - After the actor has taken a command out of a saturated mailbox it emits
//!   [`ChannelEvent::Drain`], once per saturation.
//!
//! ## Failure reporting
//!
//! lapin's `on_error` callbacks are translated into `Error` followed by
//! `Close(Some(..))` events for both connections and channels. A publish that
//! fails inside the actor is reported the same way and stops the actor.
//!
//! ## Queue semantics
//!
//! Queues are never declared here. `check_queue()` performs a *passive*
//! declare, which the broker answers with an error for an absent queue.
//! Messages go to the default exchange with the queue name as routing key;
//! persistent messages use delivery mode 2.
//!
//! This module intentionally avoids exposing AMQP-specific concepts
//! (exchanges, routing keys, message properties) outside the transport
//! boundary.

use lapin::{
    //
    options::{
        //
        BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::{
    //
    log_debug,
    log_error,
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
};

/// Publish commands buffered per channel before it reports saturation.
const MAILBOX_CAPACITY: usize = 64;

const EVENT_CAPACITY: usize = 16;

/// AMQP delivery mode for messages the broker should persist.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connection supplier backed by `lapin::Connection::connect`.
///
/// # Example
///
/// ```no_run
/// use mom_publisher::{LapinConnectionSupplier, Publisher};
/// use std::sync::Arc;
///
/// # async fn example() -> mom_publisher::Result<()> {
/// let supplier = Arc::new(LapinConnectionSupplier::new("amqp://localhost:5672/%2f"));
/// let publisher = Publisher::builder(supplier).queue_name("jobs").build()?;
/// publisher.publish(&b"hello"[..]).await?;
/// # Ok(())
/// # }
/// ```
pub struct LapinConnectionSupplier {
    uri: String,
}

impl LapinConnectionSupplier {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait::async_trait]
impl ConnectionSupplier for LapinConnectionSupplier {
    async fn get_connection(&self) -> Result<ConnectionPtr> {
        // ---
        log_info!("Connecting to AMQP broker: {}", self.uri);

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                let msg = format!("amqp: connection failed: {e}");
                log_error!("{msg}");
                PublishError::Connection(msg)
            })?;

        log_info!("Connected to AMQP broker");
        Ok(LapinConnection::create(connection))
    }
}

struct LapinConnection {
    connection: Arc<Connection>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl LapinConnection {
    fn create(connection: Connection) -> ConnectionPtr {
        // ---
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let tx = events.clone();
        connection.on_error(move |e| {
            let err = PublishError::Connection(format!("amqp: {e}"));
            let _ = tx.send(ConnectionEvent::Error(err.clone()));
            let _ = tx.send(ConnectionEvent::Close(Some(err)));
        });

        Arc::new(Self {
            connection: Arc::new(connection),
            events,
        })
    }
}

impl Drop for LapinConnection {
    fn drop(&mut self) {
        // ---
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = Arc::clone(&self.connection);
        runtime.spawn(async move {
            let _ = connection.close(200, "Normal shutdown".into()).await;
        });
    }
}

#[async_trait::async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<ChannelPtr> {
        // ---
        let channel = self.connection.create_channel().await.map_err(|e| {
            let msg = format!("amqp: channel creation failed: {e}");
            log_error!("{msg}");
            PublishError::Channel(msg)
        })?;

        log_info!("Created AMQP channel");
        Ok(LapinChannel::create(channel))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

//
// Actor commands
//

struct Publish {
    queue: String,
    payload: Bytes,
    persistent: bool,
}

/// Channel state shared between the handle and its actor.
struct Shared {
    events: broadcast::Sender<ChannelEvent>,
    closed: AtomicBool,
    saturated: AtomicBool,
}

impl Shared {
    /// Mark the channel dead and report why. Only the first failure is
    /// reported.
    fn fail(&self, err: PublishError) {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(ChannelEvent::Error(err.clone()));
        let _ = self.events.send(ChannelEvent::Close(Some(err)));
    }
}

struct LapinChannel {
    channel: Channel,
    cmd_tx: mpsc::Sender<Publish>,
    shared: Arc<Shared>,
}

impl LapinChannel {
    /// Wraps `channel` and spawns its publish actor.
    fn create(channel: Channel) -> ChannelPtr {
        // ---
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            events,
            closed: AtomicBool::new(false),
            saturated: AtomicBool::new(false),
        });

        let on_error = Arc::clone(&shared);
        channel.on_error(move |e| {
            on_error.fail(PublishError::Channel(format!("amqp: {e}")));
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let actor = Actor {
            channel: channel.clone(),
            cmd_rx,
            shared: Arc::clone(&shared),
        };
        tokio::spawn(async move {
            actor.run().await;
        });

        Arc::new(Self {
            channel,
            cmd_tx,
            shared,
        })
    }
}

/// Background actor task that owns the outbound side of one channel.
struct Actor {
    // ---
    channel: Channel,
    cmd_rx: mpsc::Receiver<Publish>,
    shared: Arc<Shared>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("AMQP channel actor started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.shared.saturated.swap(false, Ordering::SeqCst) {
                let _ = self.shared.events.send(ChannelEvent::Drain);
            }

            if let Err(err) = self.do_publish(cmd).await {
                log_error!("{err}");
                self.shared.fail(err);
                break;
            }
        }

        // Channel handle dropped or publish failed
        let _ = self.channel.close(200, "Normal shutdown".into()).await;

        log_debug!("AMQP channel actor stopped");
    }

    async fn do_publish(&mut self, cmd: Publish) -> Result<()> {
        // ---
        let properties = if cmd.persistent {
            BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        } else {
            BasicProperties::default()
        };

        self.channel
            .basic_publish(
                "".into(),                 // default exchange
                cmd.queue.as_str().into(), // routing key = queue name
                BasicPublishOptions::default(),
                &cmd.payload,
                properties,
            )
            .await
            .map_err(|e| PublishError::Channel(format!("amqp: publish failed: {e}")))?;

        log_debug!("Published to queue: {}", cmd.queue);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    async fn check_queue(&self, queue: &str) -> Result<()> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };

        self.channel
            .queue_declare(queue.into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| PublishError::QueueCheck {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        log_info!("Verified queue: {queue}");
        Ok(())
    }

    fn send_to_queue(&self, queue: &str, payload: Bytes, opts: SendOptions) -> Result<bool> {
        // ---
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PublishError::IllegalOperation("amqp: channel closed".into()));
        }

        let cmd = Publish {
            queue: queue.to_string(),
            payload,
            persistent: opts.persistent,
        };

        match self.cmd_tx.try_send(cmd) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.saturated.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PublishError::IllegalOperation(
                "amqp: channel actor stopped".into(),
            )),
        }
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }
}
