// tests/publisher_memory.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};

use mom_publisher::{
    //
    MemoryBroker,
    MemoryChannel,
    PublishError,
    Publisher,
    Result,
};

const QUEUE: &str = "jobs";

fn setup(capacity: usize) -> (MemoryBroker, Publisher) {
    // ---
    init_logging();
    let broker = MemoryBroker::new();
    broker.declare_queue(QUEUE);

    let publisher = Publisher::builder(broker.supplier())
        .queue_name(QUEUE)
        .maximum_in_memory_queue_size(capacity)
        .build()
        .expect("failed to build publisher");

    (broker, publisher)
}

fn spawn_publish(publisher: &Publisher, payload: &'static [u8]) -> JoinHandle<Result<()>> {
    let publisher = publisher.clone();
    tokio::spawn(async move { publisher.publish(payload).await })
}

/// Yield until `condition` holds, failing the test after one second.
async fn eventually(mut condition: impl FnMut() -> bool) {
    // ---
    let deadline = Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Publish one message so the publisher has a validated current channel.
async fn warm_up(broker: &MemoryBroker, publisher: &Publisher) -> Arc<MemoryChannel> {
    // ---
    timeout(Duration::from_secs(1), publisher.publish(&b"warm-up"[..]))
        .await
        .expect("warm-up timed out")
        .expect("warm-up failed");
    broker.current_channel().expect("channel")
}

#[tokio::test]
async fn every_publish_resolves_exactly_once() {
    // ---
    let (broker, publisher) = setup(100);

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish(format!("msg-{i}").into_bytes()).await })
        })
        .collect();

    for handle in handles {
        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("publish timed out")
            .expect("publish task panicked");
        assert!(result.is_ok());
    }

    assert_eq!(broker.messages(QUEUE).len(), 100);
    assert_eq!(publisher.queue_len(), 0);
}

#[tokio::test]
async fn publish_beyond_capacity_fails_immediately() {
    // ---
    let (broker, publisher) = setup(3);
    broker.set_available(false);

    let mut queued = Vec::new();
    for (i, payload) in [b"a", b"b", b"c"].into_iter().enumerate() {
        queued.push(spawn_publish(&publisher, payload));
        eventually(|| publisher.queue_len() == i + 1).await;
    }

    let overflow = timeout(Duration::from_millis(50), publisher.publish(&b"d"[..]))
        .await
        .expect("QueueFull must not wait on channel activity");
    assert!(matches!(overflow, Err(PublishError::QueueFull(3))));

    broker.set_available(true);
    for handle in queued {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(
        broker.payloads(QUEUE),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c")
        ]
    );
}

#[tokio::test]
async fn messages_are_handed_off_in_submission_order() {
    // ---
    let (broker, publisher) = setup(10);
    broker.set_available(false);

    let payloads: [&'static [u8]; 5] = [b"1", b"2", b"3", b"4", b"5"];
    let mut handles = Vec::new();
    for (i, payload) in payloads.into_iter().enumerate() {
        handles.push(spawn_publish(&publisher, payload));
        eventually(|| publisher.queue_len() == i + 1).await;
    }

    broker.set_available(true);
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let expected: Vec<_> = payloads.into_iter().map(Bytes::from_static).collect();
    assert_eq!(broker.payloads(QUEUE), expected);
}

#[tokio::test]
async fn timeout_without_channel_removes_entry() {
    // ---
    let (broker, publisher) = setup(2);
    broker.set_available(false);

    let start = Instant::now();
    let result = publisher
        .publish_with_timeout(&b"late"[..], Duration::from_millis(10))
        .await;

    assert!(matches!(result, Err(PublishError::Timeout(d)) if d == Duration::from_millis(10)));
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(publisher.queue_len(), 0);

    // The expired entry no longer occupies a slot.
    let a = spawn_publish(&publisher, b"a");
    eventually(|| publisher.queue_len() == 1).await;
    let b = spawn_publish(&publisher, b"b");
    eventually(|| publisher.queue_len() == 2).await;

    broker.set_available(true);
    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert_eq!(
        broker.payloads(QUEUE),
        vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
    );
}

#[tokio::test]
async fn zero_timeout_means_no_timeout() {
    // ---
    let (broker, publisher) = setup(10);

    let result = timeout(
        Duration::from_secs(1),
        publisher.publish_with_timeout(&b"x"[..], Duration::ZERO),
    )
    .await
    .expect("publish timed out");

    assert!(result.is_ok());
    assert_eq!(broker.payloads(QUEUE), vec![Bytes::from_static(b"x")]);
}

#[tokio::test]
async fn saturated_channel_retries_same_head_after_drain() {
    // ---
    let (broker, publisher) = setup(10);
    let channel = warm_up(&broker, &publisher).await;
    channel.set_saturated(true);

    let first = spawn_publish(&publisher, b"first");
    eventually(|| channel.send_attempts() >= 2).await;
    let second = spawn_publish(&publisher, b"second");
    eventually(|| publisher.queue_len() == 2).await;

    // Refused, still queued, still pending.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(publisher.queue_len(), 2);
    assert!(!first.is_finished());
    assert_eq!(channel.send_attempts(), 2);

    channel.drain();

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(
        broker.payloads(QUEUE),
        vec![
            Bytes::from_static(b"warm-up"),
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second")
        ]
    );
}

#[tokio::test]
async fn publish_after_close_is_rejected() {
    // ---
    let (_broker, publisher) = setup(10);

    publisher.close_publisher();
    assert!(publisher.is_closed());

    assert!(matches!(
        publisher.publish(&b"a"[..]).await,
        Err(PublishError::Closed)
    ));
    assert!(matches!(
        publisher
            .publish_with_timeout(&b"b"[..], Duration::from_millis(10))
            .await,
        Err(PublishError::Closed)
    ));

    // Second close is a no-op
    publisher.close_publisher();
}

#[tokio::test]
async fn close_rejects_queued_messages() {
    // ---
    let (broker, publisher) = setup(10);
    broker.set_available(false);

    let a = spawn_publish(&publisher, b"a");
    let b = spawn_publish(&publisher, b"b");
    eventually(|| publisher.queue_len() == 2).await;

    publisher.close_publisher();

    assert!(matches!(a.await.unwrap(), Err(PublishError::Closed)));
    assert!(matches!(b.await.unwrap(), Err(PublishError::Closed)));
    assert_eq!(publisher.queue_len(), 0);

    broker.set_available(true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.payloads(QUEUE).is_empty());
}

#[tokio::test]
async fn queued_messages_resume_on_replacement_channel() {
    // ---
    let (broker, publisher) = setup(10);
    let channel = warm_up(&broker, &publisher).await;
    channel.set_saturated(true);

    let b = spawn_publish(&publisher, b"b");
    eventually(|| publisher.queue_len() == 1).await;
    let c = spawn_publish(&publisher, b"c");
    eventually(|| publisher.queue_len() == 2).await;

    broker
        .current_connection()
        .expect("connection")
        .crash(PublishError::Connection("connection reset".into()));

    let results = timeout(Duration::from_secs(1), async {
        (b.await.unwrap(), c.await.unwrap())
    })
    .await
    .expect("messages were not resumed");
    assert!(results.0.is_ok());
    assert!(results.1.is_ok());

    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(
        broker.payloads(QUEUE),
        vec![
            Bytes::from_static(b"warm-up"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c")
        ]
    );
}

#[tokio::test]
async fn illegal_operation_on_handoff_retries_same_head() {
    // ---
    let (broker, publisher) = setup(10);
    let channel = warm_up(&broker, &publisher).await;
    channel.set_saturated(true);

    let first = spawn_publish(&publisher, b"first");
    eventually(|| channel.send_attempts() >= 2).await;
    let second = spawn_publish(&publisher, b"second");
    eventually(|| publisher.queue_len() == 2).await;

    // The retried head hits a channel that is going away.
    channel.fail_next_send(PublishError::IllegalOperation("channel closing".into()));
    channel.drain();

    let results = timeout(Duration::from_secs(1), async {
        (first.await.unwrap(), second.await.unwrap())
    })
    .await
    .expect("messages were not retried");
    assert!(results.0.is_ok());
    assert!(results.1.is_ok());

    // warm-up, refused, failed, then one accepted send each
    assert_eq!(channel.send_attempts(), 5);
    assert_eq!(
        broker.payloads(QUEUE),
        vec![
            Bytes::from_static(b"warm-up"),
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second")
        ]
    );
    assert!(publisher.fatal_error().is_none());
    assert!(!publisher.is_closed());
}

#[tokio::test]
async fn illegal_operation_during_validation_skips_channel() {
    // ---
    init_logging();
    let broker = MemoryBroker::new();
    broker.declare_queue(QUEUE);
    broker.fail_next_queue_check(PublishError::IllegalOperation("channel closing".into()));

    let publisher = Publisher::builder(broker.supplier())
        .queue_name(QUEUE)
        .build()
        .expect("failed to build publisher");
    eventually(|| broker.queue_checks() == 1).await;

    // The unvalidated channel never becomes current.
    let a = spawn_publish(&publisher, b"a");
    eventually(|| publisher.queue_len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!a.is_finished());
    assert!(broker.payloads(QUEUE).is_empty());
    assert!(publisher.fatal_error().is_none());

    broker.current_channel().expect("channel").close();

    let result = timeout(Duration::from_secs(1), a)
        .await
        .expect("message was not delivered on the next channel")
        .unwrap();
    assert!(result.is_ok());

    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(broker.queue_checks(), 2);
    assert_eq!(broker.payloads(QUEUE), vec![Bytes::from_static(b"a")]);
    assert!(publisher.fatal_error().is_none());
    assert!(!publisher.is_closed());
}

#[tokio::test]
async fn non_transient_send_failure_is_fatal() {
    // ---
    let (broker, publisher) = setup(10);
    let channel = warm_up(&broker, &publisher).await;

    channel.fail_next_send(PublishError::Channel("PRECONDITION_FAILED".into()));

    let result = publisher.publish(&b"doomed"[..]).await;
    assert!(matches!(result, Err(PublishError::Closed)));

    let fatal = timeout(Duration::from_secs(1), publisher.wait_fatal())
        .await
        .expect("no fatal error reported");
    assert!(matches!(fatal, PublishError::Channel(_)));
    assert!(matches!(publisher.fatal_error(), Some(PublishError::Channel(_))));
    assert!(publisher.is_closed());
}

#[tokio::test]
async fn missing_queue_is_fatal() {
    // ---
    init_logging();
    let broker = MemoryBroker::new();
    let publisher = Publisher::builder(broker.supplier())
        .queue_name("nowhere")
        .build()
        .expect("failed to build publisher");

    let fatal = timeout(Duration::from_secs(1), publisher.wait_fatal())
        .await
        .expect("no fatal error reported");

    assert!(matches!(fatal, PublishError::QueueCheck { ref queue, .. } if queue == "nowhere"));
    assert!(matches!(
        publisher.publish(&b"a"[..]).await,
        Err(PublishError::Closed)
    ));
}

#[tokio::test]
async fn persistence_flag_is_forwarded() {
    // ---
    init_logging();
    let broker = MemoryBroker::new();
    broker.declare_queue(QUEUE);

    let durable = Publisher::builder(broker.supplier())
        .queue_name(QUEUE)
        .build()
        .unwrap();
    let transient = Publisher::builder(broker.supplier())
        .queue_name(QUEUE)
        .persistent(false)
        .build()
        .unwrap();

    durable.publish(&b"durable"[..]).await.unwrap();
    transient.publish(&b"transient"[..]).await.unwrap();

    let messages = broker.messages(QUEUE);
    assert_eq!(messages.len(), 2);
    assert!(messages[0].persistent);
    assert!(!messages[1].persistent);
}

#[tokio::test]
async fn hooks_follow_reconnects() {
    // ---
    init_logging();
    let broker = MemoryBroker::new();
    broker.declare_queue(QUEUE);

    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let (o, c) = (Arc::clone(&opened), Arc::clone(&closed));

    let publisher = Publisher::builder(broker.supplier())
        .queue_name(QUEUE)
        .on_opened(move || {
            o.fetch_add(1, Ordering::SeqCst);
        })
        .on_closed(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    publisher.publish(&b"a"[..]).await.unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    broker
        .current_connection()
        .expect("connection")
        .crash(PublishError::Connection("gone".into()));
    broker.wait_for_channels(2).await;

    publisher.publish(&b"b"[..]).await.unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 2);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    publisher.close_publisher();
    eventually(|| closed.load(Ordering::SeqCst) == 2).await;
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
