//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue declare error: {0}")]
    Declare(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl QueueError {
    /// True when the broker itself was unreachable. The API boundary maps
    /// this to a service-unavailable response.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Raised by the processing collaborator. Never escapes the consumer loop;
/// a failed message is left for broker redelivery instead.
#[derive(Debug, Error)]
#[error("processing error: {0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
