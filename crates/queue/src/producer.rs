//! Durable message publishing.

use std::sync::Arc;

use tracing::debug;

use rohrpost_core::IngestionMessage;

use crate::backend::{QueueBackend, QueueConnection};
use crate::connection::{BackoffPolicy, ConnectionManager};
use crate::error::QueueError;

/// Publishes accepted ingestion requests to the durable queue.
///
/// Each publish runs a full connection cycle (open, declare, publish,
/// close), so concurrent API requests never share broker state and one
/// request's failure cannot poison another's connection. Exactly one
/// enqueue attempt per call; retries are the caller's decision.
pub struct Producer {
    manager: ConnectionManager,
    queue: String,
}

impl Producer {
    pub fn new(backend: Arc<dyn QueueBackend>, queue: impl Into<String>) -> Self {
        Self {
            manager: ConnectionManager::new(backend, BackoffPolicy::default()),
            queue: queue.into(),
        }
    }

    /// Publish one message durably. `Connection` errors mean the broker was
    /// unreachable and nothing was enqueued; the API boundary maps them to
    /// service-unavailable.
    pub async fn publish(&self, message: &IngestionMessage) -> Result<(), QueueError> {
        let conn = self.manager.connect().await?;
        let result = self.publish_on(conn.as_ref(), message).await;
        // Release on every path, success or not.
        if let Err(e) = conn.close().await {
            debug!(error = %e, "closing publish connection failed");
        }
        result
    }

    async fn publish_on(
        &self,
        conn: &dyn QueueConnection,
        message: &IngestionMessage,
    ) -> Result<(), QueueError> {
        conn.declare(&self.queue, true).await?;
        let payload = message.to_bytes()?;
        conn.publish(&self.queue, &payload).await?;
        debug!(
            queue = %self.queue,
            source = %message.source,
            bytes = payload.len(),
            "message published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::backend::DeliveryStream;
    use crate::memory::MemoryBroker;

    fn sample() -> IngestionMessage {
        let mut data = serde_json::Map::new();
        data.insert("x".to_string(), json!(1));
        IngestionMessage::new(data, "test", "2024-01-01T00:00:00Z").unwrap()
    }

    #[tokio::test]
    async fn publish_enqueues_exactly_one_message() {
        let broker = MemoryBroker::new();
        let producer = Producer::new(Arc::new(broker.clone()), "q");

        producer.publish(&sample()).await.unwrap();
        assert_eq!(broker.depth("q"), 1);

        // The enqueued payload round-trips to the same mapping.
        let conn = broker.connect().await.unwrap();
        let mut stream = conn.consume("q", 1).await.unwrap();
        let delivery = stream.next().await.unwrap();
        let decoded = IngestionMessage::from_bytes(&delivery.body).unwrap();
        assert_eq!(decoded, sample());
    }

    #[tokio::test]
    async fn unavailable_broker_fails_without_enqueueing() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let producer = Producer::new(Arc::new(broker.clone()), "q");

        let err = producer.publish(&sample()).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn no_retry_on_failure() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let producer = Producer::new(Arc::new(broker.clone()), "q");

        // Broker comes back, but the failed call must not have retried.
        producer.publish(&sample()).await.unwrap_err();
        broker.set_available(true);
        assert_eq!(broker.depth("q"), 0);
    }

    /// Connection that accepts the declare but fails the publish, recording
    /// whether it was released afterwards.
    #[derive(Debug)]
    struct FailingConnection {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl QueueConnection for FailingConnection {
        async fn declare(&self, _queue: &str, _durable: bool) -> Result<(), QueueError> {
            Ok(())
        }

        async fn publish(&self, _queue: &str, _payload: &[u8]) -> Result<(), QueueError> {
            Err(QueueError::Publish("simulated publish failure".into()))
        }

        async fn consume(
            &self,
            _queue: &str,
            _prefetch: u16,
        ) -> Result<Box<dyn DeliveryStream>, QueueError> {
            Err(QueueError::Consume("not a consumer".into()))
        }

        async fn close(&self) -> Result<(), QueueError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingBackend {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl QueueBackend for FailingBackend {
        async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError> {
            Ok(Box::new(FailingConnection {
                closed: self.closed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn connection_released_on_publish_failure() {
        let closed = Arc::new(AtomicBool::new(false));
        let backend = FailingBackend {
            closed: closed.clone(),
        };
        let producer = Producer::new(Arc::new(backend), "q");

        let err = producer.publish(&sample()).await.unwrap_err();
        assert!(matches!(err, QueueError::Publish(_)));
        assert!(closed.load(Ordering::SeqCst), "connection must be released");
    }
}
