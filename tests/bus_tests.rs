use std::time::Duration;

use chime::bus::{ExecutionBus, MemoryExecutionBus, MemoryWriteBus, WriteBus, WriteBusConsumer};

const SHORT: Duration = Duration::from_millis(50);

#[tokio::test]
async fn test_write_bus_keyed_ordering() {
    let bus = MemoryWriteBus::new(4);
    for i in 0..3u8 {
        bus.publish("job-a", vec![i]).await.unwrap();
    }

    let mut consumer = bus.subscribe("writer").await.unwrap();
    for expected in 0..3u8 {
        let record = consumer.poll(SHORT).await.unwrap().unwrap();
        assert_eq!(record.key, "job-a");
        assert_eq!(record.payload, vec![expected]);
        consumer.commit(&record).await.unwrap();
    }
    assert!(consumer.poll(SHORT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_write_bus_redelivers_uncommitted_on_rejoin() {
    let bus = MemoryWriteBus::new(1);
    bus.publish("a", b"first".to_vec()).await.unwrap();
    bus.publish("b", b"second".to_vec()).await.unwrap();

    let mut consumer = bus.subscribe("writer").await.unwrap();
    let first = consumer.poll(SHORT).await.unwrap().unwrap();
    consumer.commit(&first).await.unwrap();
    // Second record delivered but never committed.
    let second = consumer.poll(SHORT).await.unwrap().unwrap();
    assert_eq!(second.payload, b"second".to_vec());
    drop(consumer);

    let mut rejoined = bus.subscribe("writer").await.unwrap();
    let redelivered = rejoined.poll(SHORT).await.unwrap().unwrap();
    assert_eq!(redelivered.payload, b"second".to_vec());
}

#[tokio::test]
async fn test_write_bus_groups_are_independent() {
    let bus = MemoryWriteBus::new(2);
    bus.publish("a", b"x".to_vec()).await.unwrap();

    let mut writer = bus.subscribe("writer").await.unwrap();
    let record = writer.poll(SHORT).await.unwrap().unwrap();
    writer.commit(&record).await.unwrap();

    let mut audit = bus.subscribe("audit").await.unwrap();
    assert!(audit.poll(SHORT).await.unwrap().is_some());
}

#[tokio::test]
async fn test_write_bus_long_poll_wakes_on_publish() {
    let bus = std::sync::Arc::new(MemoryWriteBus::new(2));
    let mut consumer = bus.subscribe("writer").await.unwrap();

    let publisher = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        publisher.publish("k", b"late".to_vec()).await.unwrap();
    });

    let start = tokio::time::Instant::now();
    let record = consumer.poll(Duration::from_secs(2)).await.unwrap();
    assert!(record.is_some());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_execution_bus_receive_and_delete() {
    let bus = MemoryExecutionBus::new(Duration::from_secs(5));
    bus.send("payload".to_string()).await.unwrap();

    let batch = bus.receive(10, SHORT).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].body, "payload");
    assert_eq!(batch[0].receive_count, 1);

    // Claimed messages are invisible to other receivers.
    assert!(bus.receive(10, SHORT).await.unwrap().is_empty());

    bus.delete(batch[0].receipt_handle).await.unwrap();
    assert_eq!(bus.depth().await, 0);
}

#[tokio::test]
async fn test_execution_bus_redelivers_after_visibility_timeout() {
    let bus = MemoryExecutionBus::new(Duration::from_millis(100));
    bus.send("payload".to_string()).await.unwrap();

    let first = bus.receive(10, SHORT).await.unwrap();
    assert_eq!(first.len(), 1);

    // No acknowledgement; after the timeout the message reappears with a
    // fresh receipt handle and a bumped receive count.
    let second = bus.receive(10, Duration::from_secs(2)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, first[0].message_id);
    assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
    assert_eq!(second[0].receive_count, 2);
}

#[tokio::test]
async fn test_execution_bus_stale_receipt_does_not_delete() {
    let bus = MemoryExecutionBus::new(Duration::from_millis(50));
    bus.send("payload".to_string()).await.unwrap();

    let first = bus.receive(10, SHORT).await.unwrap();
    let second = bus.receive(10, Duration::from_secs(2)).await.unwrap();
    assert_eq!(second.len(), 1);

    // The first claim's handle expired with its visibility window.
    bus.delete(first[0].receipt_handle).await.unwrap();
    assert_eq!(bus.depth().await, 1);

    bus.delete(second[0].receipt_handle).await.unwrap();
    assert_eq!(bus.depth().await, 0);
}

#[tokio::test]
async fn test_execution_bus_batches_up_to_max() {
    let bus = MemoryExecutionBus::new(Duration::from_secs(5));
    for i in 0..15 {
        bus.send(format!("m{i}")).await.unwrap();
    }
    let batch = bus.receive(10, SHORT).await.unwrap();
    assert_eq!(batch.len(), 10);
    // Claim order follows enqueue order.
    assert_eq!(batch[0].body, "m0");
    assert_eq!(batch[9].body, "m9");
}

#[tokio::test]
async fn test_execution_bus_dead_letters_poison_messages() {
    let bus = MemoryExecutionBus::new(Duration::from_millis(20)).with_max_receive_count(2);
    bus.send("poison".to_string()).await.unwrap();

    // Two deliveries without acknowledgement exhaust the budget.
    for _ in 0..2 {
        let batch = bus.receive(10, Duration::from_secs(2)).await.unwrap();
        assert_eq!(batch.len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    assert!(bus.receive(10, Duration::from_millis(100)).await.unwrap().is_empty());
    assert_eq!(bus.dead_letters().await, vec!["poison".to_string()]);
    assert_eq!(bus.depth().await, 0);
}
