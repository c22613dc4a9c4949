//! Reliable publishing against the in-memory broker.
//!
//! Publishes a burst of messages, crashes the broker connection halfway
//! through and shows that every message still arrives, in order, on the
//! replacement channel.
//!
//! Run with: RUST_LOG=debug cargo run --example memory_publisher --features logging

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use mom_publisher::{MemoryBroker, PublishError, Publisher, Result};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let broker = MemoryBroker::new();
    broker.declare_queue("orders");

    let publisher = Publisher::builder(broker.supplier())
        .queue_name("orders")
        .maximum_in_memory_queue_size(50)
        .on_opened(|| println!("-- broker connection opened"))
        .on_closed(|| println!("-- broker connection closed"))
        .build()?;

    let mut pending = Vec::new();
    for i in 0..20 {
        if i == 10 {
            if let Some(connection) = broker.current_connection() {
                connection.crash(PublishError::Connection("simulated outage".into()));
            }
        }
        let publisher = publisher.clone();
        pending.push(tokio::spawn(async move {
            publisher
                .publish_with_timeout(format!("order-{i}").into_bytes(), Duration::from_secs(2))
                .await
        }));
    }

    for handle in pending {
        handle.await.expect("publish task panicked")?;
    }

    for delivery in broker.messages("orders") {
        println!("{}", String::from_utf8_lossy(&delivery.payload));
    }
    println!("connections opened: {}", broker.connections_opened());

    publisher.close_publisher();
    Ok(())
}
