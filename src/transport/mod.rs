//! Broker client implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`ConnectionSupplier`](crate::ConnectionSupplier),
//! [`BrokerConnection`](crate::BrokerConnection) and
//! [`BrokerChannel`](crate::BrokerChannel) traits. Client-library backends are
//! hidden behind feature flags; the in-memory broker is always built.
//!
//! Publisher and lifecycle code must not depend on backend-specific types.

mod memory;

#[cfg(feature = "transport_lapin")]
mod amqp;

pub use memory::{Delivery, MemoryBroker, MemoryChannel, MemoryConnection};

#[cfg(feature = "transport_lapin")]
pub use amqp::LapinConnectionSupplier;
