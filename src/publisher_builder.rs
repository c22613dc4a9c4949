//! Publisher builder.
//!
//! Provides a fluent builder API for configuring [`Publisher`] instances
//! with queue, buffering and reconnect settings.

use std::time::Duration;

use crate::{
    //
    LifecycleHooks,
    PublishError,
    Publisher,
    PublisherOptions,
    Result,
    RetryConfig,
    SupplierPtr,
};

/// Builder for creating [`Publisher`] instances.
///
/// Accepts a connection supplier and allows configuration of the
/// destination queue, message durability, local buffering, reconnect
/// pacing and lifecycle hooks.
///
/// # Examples
///
/// ## Fixed queue, defaults everywhere else
/// ```no_run
/// use mom_publisher::{MemoryBroker, PublisherBuilder};
///
/// # async fn example() -> mom_publisher::Result<()> {
/// let broker = MemoryBroker::new();
/// let publisher = PublisherBuilder::new(broker.supplier())
///     .queue_name("jobs")
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// ## Transient messages with reconnect backoff
/// ```no_run
/// use mom_publisher::{MemoryBroker, PublisherBuilder};
/// use std::time::Duration;
///
/// # async fn example() -> mom_publisher::Result<()> {
/// let broker = MemoryBroker::new();
/// let publisher = PublisherBuilder::new(broker.supplier())
///     .queue_name("metrics")
///     .persistent(false)
///     .maximum_in_memory_queue_size(10_000)
///     .retry_initial_delay(Duration::from_millis(200))
///     .retry_max_delay(Duration::from_secs(10))
///     .on_opened(|| println!("broker connection up"))
///     .on_closed(|| println!("broker connection down"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PublisherBuilder {
    // ---
    supplier: SupplierPtr,
    options: Option<PublisherOptions>,
    queue_name: Option<String>,
    persistent: Option<bool>,
    maximum_in_memory_queue_size: Option<usize>,
    close_grace: Option<Duration>,

    // Retry configuration (all optional)
    retry_multiplier: Option<f32>,
    retry_initial_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,

    hooks: LifecycleHooks,
}

impl PublisherBuilder {
    /// Create a new publisher builder.
    ///
    /// [`queue_name`](Self::queue_name) is required, either directly or
    /// through [`options`](Self::options).
    pub fn new(supplier: SupplierPtr) -> Self {
        // ---
        Self {
            supplier,
            options: None,
            queue_name: None,
            persistent: None,
            maximum_in_memory_queue_size: None,
            close_grace: None,
            retry_multiplier: None,
            retry_initial_delay: None,
            retry_max_delay: None,
            hooks: LifecycleHooks::default(),
        }
    }

    /// Start from a complete options value, typically loaded from a config
    /// file. Individual setters called on the builder take precedence.
    pub fn options(mut self, options: PublisherOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Set the destination queue. It must already exist on the broker.
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    /// Flag messages for durable storage.
    ///
    /// Default: true.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Bound the number of messages held locally.
    ///
    /// Default: 100.
    pub fn maximum_in_memory_queue_size(mut self, size: usize) -> Self {
        self.maximum_in_memory_queue_size = Some(size);
        self
    }

    /// Set how long a channel close waits for a competing connection error.
    ///
    /// Default: 10ms.
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = Some(grace);
        self
    }

    /// Replace the whole reconnect policy.
    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry_multiplier = Some(retry.multiplier);
        self.retry_initial_delay = Some(retry.initial_delay);
        self.retry_max_delay = Some(retry.max_delay);
        self
    }

    /// Set reconnect backoff multiplier.
    ///
    /// Default: 2.0 (only used once an initial delay is set).
    pub fn retry_multiplier(mut self, multiplier: f32) -> Self {
        self.retry_multiplier = Some(multiplier);
        self
    }

    /// Set the delay before the first reconnect attempt.
    ///
    /// Default: zero, reconnect immediately.
    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.retry_initial_delay = Some(delay);
        self
    }

    /// Set maximum delay between reconnect attempts.
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = Some(delay);
        self
    }

    /// Called each time a connection has been acquired.
    pub fn on_opened<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_opened = std::sync::Arc::new(hook);
        self
    }

    /// Called once per attempt when that attempt is cleaned up.
    pub fn on_closed<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_closed = std::sync::Arc::new(hook);
        self
    }

    /// Build the publisher (consumes self).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Publisher> {
        // ---
        let mut options = match (self.options, self.queue_name) {
            (Some(mut options), Some(name)) => {
                options.queue_name = name;
                options
            }
            (Some(options), None) => options,
            (None, Some(name)) => PublisherOptions::new(name),
            (None, None) => return Err(PublishError::MissingConfig("queue_name".into())),
        };

        if let Some(persistent) = self.persistent {
            options.persistent = persistent;
        }
        if let Some(size) = self.maximum_in_memory_queue_size {
            options.maximum_in_memory_queue_size = size;
        }
        if let Some(grace) = self.close_grace {
            options.close_grace = grace;
        }
        if let Some(multiplier) = self.retry_multiplier {
            options.retry.multiplier = multiplier;
        }
        if let Some(delay) = self.retry_initial_delay {
            options.retry.initial_delay = delay;
        }
        if let Some(delay) = self.retry_max_delay {
            options.retry.max_delay = delay;
        }

        Publisher::create(self.supplier, self.hooks, options)
    }
}
