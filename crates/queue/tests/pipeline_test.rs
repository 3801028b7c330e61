//! End-to-end pipeline scenarios: API-side publish through broker to
//! consumer-side acknowledgment, including crash/redelivery behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use rohrpost_core::{IngestionMessage, INGESTION_QUEUE};
use rohrpost_queue::{
    BackoffPolicy, Consumer, DeliveryStream, MemoryBroker, Processor, ProcessingError, Producer,
    QueueBackend, QueueConnection,
};

const WAIT: Duration = Duration::from_millis(5);

struct CountingProcessor {
    processed: AtomicUsize,
    last: Mutex<Option<IngestionMessage>>,
}

impl CountingProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            processed: AtomicUsize::new(0),
            last: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Processor for CountingProcessor {
    async fn process(&self, message: &IngestionMessage) -> Result<(), ProcessingError> {
        *self.last.lock().unwrap() = Some(message.clone());
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sample() -> IngestionMessage {
    let mut data = serde_json::Map::new();
    data.insert("x".to_string(), json!(1));
    IngestionMessage::new(data, "test", "2024-01-01T00:00:00Z").unwrap()
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(WAIT).await;
    }
    panic!("condition not met within timeout");
}

/// Publish → consume → ack: the consumer sees an equivalent mapping and the
/// queue drains back to zero.
#[tokio::test]
async fn publish_process_ack_roundtrip() {
    let broker = MemoryBroker::new();
    let producer = Producer::new(Arc::new(broker.clone()), INGESTION_QUEUE);
    producer.publish(&sample()).await.unwrap();
    assert_eq!(broker.depth(INGESTION_QUEUE), 1);

    let processor = CountingProcessor::new();
    let consumer = Arc::new(
        Consumer::new(
            Arc::new(broker.clone()),
            INGESTION_QUEUE,
            processor.clone(),
        )
        .with_backoff(BackoffPolicy::Fixed(Duration::from_millis(5))),
    );
    let handle = consumer.shutdown_handle();
    let task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    {
        let broker = broker.clone();
        let processor = processor.clone();
        eventually(move || {
            processor.processed.load(Ordering::SeqCst) == 1 && broker.depth(INGESTION_QUEUE) == 0
        })
        .await;
    }

    let received = processor.last.lock().unwrap().clone().unwrap();
    assert_eq!(received, sample());

    handle.shutdown();
    task.await.unwrap().unwrap();
}

/// A consumer that dies after receiving but before acknowledging leaves the
/// message in the queue; it is redelivered to the next session.
#[tokio::test]
async fn crash_before_ack_redelivers() {
    let broker = MemoryBroker::new();
    let producer = Producer::new(Arc::new(broker.clone()), INGESTION_QUEUE);
    producer.publish(&sample()).await.unwrap();

    // First consumer session: receive, then crash (drop without ack).
    {
        let conn = broker.connect().await.unwrap();
        let mut stream = conn.consume(INGESTION_QUEUE, 1).await.unwrap();
        let delivery = stream.next().await.unwrap();
        assert!(!delivery.redelivered);
        assert_eq!(broker.depth(INGESTION_QUEUE), 1);
    }

    // Still owned by the queue — nothing was acknowledged.
    assert_eq!(broker.depth(INGESTION_QUEUE), 1);

    // Second session gets the same message again and settles it.
    let conn = broker.connect().await.unwrap();
    let mut stream = conn.consume(INGESTION_QUEUE, 1).await.unwrap();
    let redelivery = stream.next().await.unwrap();
    assert!(redelivery.redelivered);
    let decoded = IngestionMessage::from_bytes(&redelivery.body).unwrap();
    assert_eq!(decoded, sample());
    stream.ack(redelivery.tag).await.unwrap();
    assert_eq!(broker.depth(INGESTION_QUEUE), 0);
}

/// Broker down at publish time: the producer fails fast with a connection
/// error and the queue is untouched.
#[tokio::test]
async fn publish_fails_fast_when_broker_down() {
    let broker = MemoryBroker::new();
    let producer = Producer::new(Arc::new(broker.clone()), INGESTION_QUEUE);
    producer.publish(&sample()).await.unwrap();

    broker.set_available(false);
    let err = producer.publish(&sample()).await.unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(broker.depth(INGESTION_QUEUE), 1);
}

/// Two worker processes against one queue: the broker hands each pending
/// message to exactly one of them.
#[tokio::test]
async fn competing_workers_split_the_queue() {
    let broker = MemoryBroker::new();
    let producer = Producer::new(Arc::new(broker.clone()), INGESTION_QUEUE);
    for _ in 0..6 {
        producer.publish(&sample()).await.unwrap();
    }

    let processor_a = CountingProcessor::new();
    let processor_b = CountingProcessor::new();
    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for processor in [processor_a.clone(), processor_b.clone()] {
        let consumer = Arc::new(
            Consumer::new(Arc::new(broker.clone()), INGESTION_QUEUE, processor)
                .with_backoff(BackoffPolicy::Fixed(Duration::from_millis(5))),
        );
        handles.push(consumer.shutdown_handle());
        tasks.push(tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.run().await }
        }));
    }

    {
        let broker = broker.clone();
        let a = processor_a.clone();
        let b = processor_b.clone();
        eventually(move || {
            a.processed.load(Ordering::SeqCst) + b.processed.load(Ordering::SeqCst) == 6
                && broker.depth(INGESTION_QUEUE) == 0
        })
        .await;
    }

    for handle in handles {
        handle.shutdown();
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}
