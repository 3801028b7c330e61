//! Boot-time broker probe.

use tracing::{info, warn};

use rohrpost_core::INGESTION_QUEUE;
use rohrpost_queue::QueueBackend;

/// Reach out to the broker once and pre-declare the ingestion queue.
///
/// A failure here is logged, not fatal: the API can start serving and
/// `/ingest` will answer 503 until the broker comes up.
pub async fn probe_broker(backend: &dyn QueueBackend) {
    match backend.connect().await {
        Ok(conn) => {
            match conn.declare(INGESTION_QUEUE, true).await {
                Ok(()) => info!(queue = INGESTION_QUEUE, "broker reachable, queue declared"),
                Err(e) => warn!(queue = INGESTION_QUEUE, error = %e, "queue declaration failed"),
            }
            let _ = conn.close().await;
        }
        Err(e) => {
            warn!(
                error = %e,
                "broker not reachable at startup — /ingest will return 503 until it is"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rohrpost_queue::{MemoryBroker, QueueConnection};

    #[tokio::test]
    async fn probe_declares_queue() {
        let broker = MemoryBroker::new();
        probe_broker(&broker).await;

        // Redeclaring with the same durability must be a no-op.
        let conn = broker.connect().await.unwrap();
        conn.declare(INGESTION_QUEUE, true).await.unwrap();
    }

    #[tokio::test]
    async fn probe_survives_unreachable_broker() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        probe_broker(&broker).await;
    }
}
