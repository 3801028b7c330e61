pub mod config;
pub mod message;

pub use config::Config;
pub use message::{IngestionMessage, MessageError};

/// Name of the durable queue shared by producer and consumer.
pub const INGESTION_QUEUE: &str = "ingestion_queue";
