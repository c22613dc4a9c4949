// src/domain/broker.rs

//! Broker collaborator abstractions.
//!
//! This module defines the domain-level interface between the publisher core
//! and whatever client library actually talks to the broker. It intentionally
//! avoids any reference to concrete protocols or client crates.
//!
//! Three roles are modelled:
//!
//! - a [`ConnectionSupplier`] that produces connections on demand,
//! - a [`BrokerConnection`], the transport-level session,
//! - a [`BrokerChannel`], a lightweight virtual session multiplexed over one
//!   connection and used to hand payloads to a named queue.
//!
//! Connections and channels report their termination through event
//! subscriptions rather than callbacks. Each call to `events()` returns an
//! independent receiver; dropping the receiver unregisters the listener. A
//! receiver that observes its sender dropped treats that as a clean close of
//! the source.
//!
//! Concrete implementations live under `src/transport/`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::{PublishError, Result};

/// Termination notifications emitted by a [`BrokerConnection`].
///
/// A connection emits at most one `Close` and one `Error` per lifetime.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection closed, optionally carrying the underlying cause.
    Close(Option<PublishError>),

    /// The connection reported an error.
    Error(PublishError),
}

/// Notifications emitted by a [`BrokerChannel`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel closed, optionally carrying the underlying cause.
    Close(Option<PublishError>),

    /// The channel reported an error.
    Error(PublishError),

    /// A previously saturated outbound buffer has been flushed.
    Drain,
}

/// Per-message options for [`BrokerChannel::send_to_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Ask the broker to store the message durably.
    pub persistent: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { persistent: true }
    }
}

/// Produces connections to the broker on demand.
///
/// Establishing and authenticating the physical connection is entirely the
/// supplier's concern. A supplier may be asked for a connection any number of
/// times; each lifecycle attempt asks once.
#[async_trait::async_trait]
pub trait ConnectionSupplier: Send + Sync {
    /// Acquire a connection. May suspend for as long as the broker is
    /// unreachable.
    async fn get_connection(&self) -> Result<ConnectionPtr>;
}

/// A transport-level session to the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<ChannelPtr>;

    /// Subscribe to close and error notifications.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// A virtual session bound to exactly one connection.
///
/// Once a channel has closed or errored it is permanently invalid; it is
/// never reused.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Verify that `queue` exists. Fails if it is absent.
    async fn check_queue(&self, queue: &str) -> Result<()>;

    /// Hand `payload` to the channel for delivery to `queue`.
    ///
    /// Returns `Ok(true)` when the payload was accepted immediately and
    /// `Ok(false)` when the local outbound buffer is saturated; in that case
    /// the caller should wait for [`ChannelEvent::Drain`] before retrying.
    /// A channel that is closing reports [`PublishError::IllegalOperation`].
    fn send_to_queue(&self, queue: &str, payload: Bytes, opts: SendOptions) -> Result<bool>;

    /// Subscribe to close, error and drain notifications.
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;
}

/// Shared connection supplier pointer.
pub type SupplierPtr = Arc<dyn ConnectionSupplier>;

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn BrokerConnection>;

/// Shared channel pointer.
///
/// `.clone()` is cheap; all clones refer to the same underlying channel.
pub type ChannelPtr = Arc<dyn BrokerChannel>;
