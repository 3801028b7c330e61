//! Queue backend traits and delivery types.
//!
//! Different brokers expose many configuration knobs. This is the bare
//! minimum contract the pipeline needs: connection management, idempotent
//! queue declaration, durable publishing, and prefetch-bounded consumption
//! with explicit acknowledgment.

use std::fmt;

use async_trait::async_trait;

use crate::error::QueueError;

/// Opaque handle correlating one delivered message instance to its ack/nack
/// call. Valid only for the session that delivered it — never reuse a tag
/// across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub(crate) fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to the consumer loop.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Session-scoped acknowledgment handle.
    pub tag: DeliveryTag,
    /// Raw message body as published.
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    /// Number of times this message has been delivered, this one included.
    /// Best-effort where the broker does not track it exactly.
    pub attempt: u32,
}

/// A broker endpoint that can open connections.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Establish a fresh connection. One attempt, no retry; retry policy
    /// belongs to the caller.
    async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait QueueConnection: Send + Sync + fmt::Debug {
    /// Declare a named queue. Idempotent: redeclaring with the same
    /// durability flag is a no-op; a mismatched flag is an error.
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError>;

    /// Publish a payload with the persistent delivery flag set, so the
    /// broker stores it before considering it enqueued.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Start consuming with at most `prefetch` unacknowledged deliveries
    /// outstanding at a time.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, QueueError>;

    /// Release the connection. Idempotent — safe to call on every exit path.
    async fn close(&self) -> Result<(), QueueError>;
}

/// An open consume session on one queue.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery. Blocks until a message is available or
    /// the connection fails.
    async fn next(&mut self) -> Result<Delivery, QueueError>;

    /// Acknowledge successful processing — removes the message from the queue.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Negative-acknowledge — returns the message to the queue for redelivery.
    async fn nack(&mut self, tag: DeliveryTag) -> Result<(), QueueError>;
}
