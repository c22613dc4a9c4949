use std::time::Duration;

use thiserror::Error;

/// Errors produced by the publisher, the channel lifecycle and the broker
/// collaborators behind them.
///
/// Only [`QueueFull`](PublishError::QueueFull), [`Closed`](PublishError::Closed)
/// and [`Timeout`](PublishError::Timeout) ever reach a `publish()` caller.
/// Connection and channel failures are absorbed by the lifecycle supervisor
/// and surface only as per-attempt outcomes.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// The caller-visible wait for local acceptance expired.
    ///
    /// The message may still reach the broker if it had already been handed
    /// to a channel when the timer fired.
    #[error("message timed out after {0:?}")]
    Timeout(Duration),

    /// The in-memory queue is at capacity.
    #[error("maximum in-memory queue size of {0} exceeded")]
    QueueFull(usize),

    /// `publish()` was called after `close_publisher()`.
    #[error("publisher already closed")]
    Closed,

    /// The underlying connection closed with an error.
    #[error("the underlying connection was closed: {0}")]
    ConnectionClosed(#[source] Box<PublishError>),

    /// Unclassified connection-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Unclassified channel-level failure.
    #[error("channel error: {0}")]
    Channel(String),

    /// Operation attempted on a channel that is closing or closed.
    ///
    /// This is the only handoff failure the delivery loop treats as transient.
    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    /// The destination queue does not exist or could not be checked.
    #[error("queue check failed for {queue}: {reason}")]
    QueueCheck { queue: String, reason: String },

    /// A required builder field was not provided.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// A builder field holds an unusable value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PublishError {
    /// Wrap a connection-level cause into [`PublishError::ConnectionClosed`].
    pub fn connection_closed(cause: PublishError) -> Self {
        PublishError::ConnectionClosed(Box::new(cause))
    }

    /// Whether a failed handoff may be retried against the next channel.
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::IllegalOperation(_))
    }
}

/// Result type alias for publisher operations
pub type Result<T> = std::result::Result<T, PublishError>;
