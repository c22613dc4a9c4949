//! Reliable, backpressured message publishing over an auto-reconnecting
//! broker channel.
//!
//! This library provides a small publishing core for AMQP-style brokers. It
//! keeps a single broker channel alive across connection failures, buffers
//! outbound messages in a bounded FIFO while no channel is usable, and
//! respects the channel's flow control without ever reordering or
//! duplicating a message.
//!
//! - [`ChannelLifecycle`] produces an endless sequence of channels from a
//!   [`ConnectionSupplier`], collapsing the close/error signals of a
//!   connection and its channel into one outcome per attempt.
//! - [`Publisher`] accepts messages, applies backpressure and per-message
//!   timeouts, and hands messages to the current channel in order.
//!
//! Broker client libraries plug in through the [`ConnectionSupplier`],
//! [`BrokerConnection`] and [`BrokerChannel`] traits. An in-memory broker
//! ([`MemoryBroker`]) is always available and serves as the reference
//! implementation for tests; a `lapin` backend is available behind the
//! `transport_lapin` feature.
//!

// Import all sub modules once...
mod domain;
mod lifecycle;
mod macros;
mod publisher;
mod transport;

mod publisher_builder;
mod publisher_options;
mod retry;

mod error;
mod message_id;
mod timeout_guard;
mod util;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use publisher::Publisher;
pub use publisher_builder::PublisherBuilder;
pub use publisher_options::{PublisherOptions, DEFAULT_MAXIMUM_IN_MEMORY_QUEUE_SIZE};

pub use lifecycle::{
    //
    AttemptState,
    CancelHandle,
    ChannelLifecycle,
    Hook,
    LifecycleEvent,
    LifecycleHooks,
    LifecycleSubscription,
    DEFAULT_CLOSE_GRACE,
};

pub use error::{PublishError, Result};
pub use message_id::MessageId;
pub use retry::RetryConfig;

pub use transport::{Delivery, MemoryBroker, MemoryChannel, MemoryConnection};

#[cfg(feature = "transport_lapin")]
pub use transport::LapinConnectionSupplier;

// --- public re-exports
pub use domain::{
    //
    BrokerChannel,
    BrokerConnection,
    ChannelEvent,
    ChannelPtr,
    ConnectionEvent,
    ConnectionPtr,
    ConnectionSupplier,
    SendOptions,
    SupplierPtr,
};
