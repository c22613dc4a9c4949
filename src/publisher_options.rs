//! Publisher configuration.
//!
//! This type intentionally contains no broker-client concepts. The
//! destination is a plain queue name; connection settings belong to the
//! [`ConnectionSupplier`](crate::ConnectionSupplier).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{PublishError, Result, RetryConfig, SendOptions, DEFAULT_CLOSE_GRACE};

/// Default bound on the in-memory queue.
pub const DEFAULT_MAXIMUM_IN_MEMORY_QUEUE_SIZE: usize = 100;

/// Options for one [`Publisher`](crate::Publisher).
///
/// Deserializable so it can be embedded in an application's own config file;
/// every field except `queue_name` has a default.
///
/// # Example
///
/// ```
/// use mom_publisher::PublisherOptions;
///
/// let options = PublisherOptions::new("jobs");
/// assert!(options.persistent);
/// assert_eq!(options.maximum_in_memory_queue_size, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherOptions {
    /// Destination queue. Must exist on the broker.
    pub queue_name: String,

    /// Flag messages for durable storage. Default: `true`.
    #[serde(default = "default_persistent")]
    pub persistent: bool,

    /// Maximum number of messages held locally. Default: 100.
    #[serde(default = "default_queue_size")]
    pub maximum_in_memory_queue_size: usize,

    /// How long a channel close waits for a competing connection error
    /// before it is reported as clean. Default: 10ms.
    #[serde(default = "default_close_grace")]
    pub close_grace: Duration,

    /// Delay policy between reconnect attempts. Default: immediate.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_persistent() -> bool {
    true
}

fn default_queue_size() -> usize {
    DEFAULT_MAXIMUM_IN_MEMORY_QUEUE_SIZE
}

fn default_close_grace() -> Duration {
    DEFAULT_CLOSE_GRACE
}

impl PublisherOptions {
    /// Options for `queue_name` with every other field defaulted.
    pub fn new(queue_name: impl Into<String>) -> Self {
        // ---
        Self {
            queue_name: queue_name.into(),
            persistent: default_persistent(),
            maximum_in_memory_queue_size: default_queue_size(),
            close_grace: default_close_grace(),
            retry: RetryConfig::default(),
        }
    }

    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            persistent: self.persistent,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        // ---
        if self.queue_name.is_empty() {
            return Err(PublishError::MissingConfig("queue_name".into()));
        }
        if self.maximum_in_memory_queue_size == 0 {
            return Err(PublishError::InvalidConfig(
                "maximum_in_memory_queue_size must be at least 1".into(),
            ));
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_deserialize_with_defaults() {
        // ---
        let options: PublisherOptions = serde_json::from_str(r#"{"queue_name": "jobs"}"#).unwrap();

        assert_eq!(options, PublisherOptions::new("jobs"));
        assert!(options.retry.is_immediate());
        assert_eq!(options.close_grace, DEFAULT_CLOSE_GRACE);
    }

    #[test]
    fn test_deserialize_overrides() {
        // ---
        let options: PublisherOptions = serde_json::from_str(
            r#"{
                "queue_name": "audit",
                "persistent": false,
                "maximum_in_memory_queue_size": 5
            }"#,
        )
        .unwrap();

        assert!(!options.persistent);
        assert_eq!(options.maximum_in_memory_queue_size, 5);
        assert_eq!(options.send_options(), SendOptions { persistent: false });
    }

    #[test]
    fn test_validate() {
        // ---
        assert!(PublisherOptions::new("jobs").validate().is_ok());
        assert!(matches!(
            PublisherOptions::new("").validate(),
            Err(PublishError::MissingConfig(_))
        ));

        let mut options = PublisherOptions::new("jobs");
        options.maximum_in_memory_queue_size = 0;
        assert!(matches!(
            options.validate(),
            Err(PublishError::InvalidConfig(_))
        ));

        let mut options = PublisherOptions::new("jobs");
        options.retry.multiplier = f32::INFINITY;
        assert!(matches!(
            options.validate(),
            Err(PublishError::InvalidConfig(_))
        ));
    }
}
