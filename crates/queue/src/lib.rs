pub mod amqp;
pub mod backend;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod producer;

pub use amqp::AmqpBackend;
pub use backend::{Delivery, DeliveryStream, DeliveryTag, QueueBackend, QueueConnection};
pub use connection::{BackoffPolicy, ConnectionManager, ConnectionState};
pub use consumer::{Consumer, ConsumerState, Processor, ShutdownHandle};
pub use error::{ProcessingError, QueueError};
pub use memory::MemoryBroker;
pub use producer::Producer;
