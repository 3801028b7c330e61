use std::sync::Arc;

use rohrpost_core::INGESTION_QUEUE;
use rohrpost_queue::{Producer, QueueBackend};

pub struct AppState {
    pub producer: Producer,
    /// Kept alongside the producer for the health probe's connection cycle.
    pub backend: Arc<dyn QueueBackend>,
}

impl AppState {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            producer: Producer::new(backend.clone(), INGESTION_QUEUE),
            backend,
        }
    }
}
