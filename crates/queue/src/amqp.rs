//! AMQP (RabbitMQ) queue backend.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ConnectionProperties};
use tracing::{debug, info};
use uuid::Uuid;

use rohrpost_core::config::BrokerConfig;

use crate::backend::{Delivery, DeliveryStream, DeliveryTag, QueueBackend, QueueConnection};
use crate::error::QueueError;

/// Delivery mode 2 marks a message persistent: the broker writes it to
/// stable storage before considering it enqueued.
const PERSISTENT: u8 = 2;

/// AMQP broker endpoint.
pub struct AmqpBackend {
    config: BrokerConfig,
}

impl AmqpBackend {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QueueBackend for AmqpBackend {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError> {
        let uri = self.config.amqp_uri();
        let connection = lapin::Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                QueueError::Connection(format!(
                    "AMQP connect to {}:{} failed: {e}",
                    self.config.host, self.config.port
                ))
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("channel open failed: {e}")))?;

        debug!(host = %self.config.host, port = self.config.port, "AMQP connection established");

        Ok(Box::new(AmqpConnection {
            connection,
            channel,
        }))
    }
}

#[derive(Debug)]
struct AmqpConnection {
    connection: lapin::Connection,
    channel: Channel,
}

#[async_trait]
impl QueueConnection for AmqpConnection {
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Declare(format!("declare '{queue}' failed: {e}")))?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        // Default exchange, routing key = queue name.
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| QueueError::Publish(format!("publish to '{queue}' failed: {e}")))?;
        confirm
            .await
            .map_err(|e| QueueError::Publish(format!("publish to '{queue}' not confirmed: {e}")))?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, QueueError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Consume(format!("setting prefetch failed: {e}")))?;

        let consumer_tag = format!("rohrpost-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                // Explicit acknowledgment: no_ack stays false.
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume(format!("consume on '{queue}' failed: {e}")))?;

        info!(queue, consumer_tag = %consumer_tag, prefetch, "AMQP consumer registered");

        Ok(Box::new(AmqpStream {
            channel: self.channel.clone(),
            consumer,
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| QueueError::Connection(format!("close failed: {e}")))?;
        Ok(())
    }
}

struct AmqpStream {
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpStream {
    async fn next(&mut self) -> Result<Delivery, QueueError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(map_delivery(delivery)),
            Some(Err(e)) => Err(QueueError::Consume(format!("delivery failed: {e}"))),
            None => Err(QueueError::Connection("consume stream closed".into())),
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.channel
            .basic_ack(tag.value(), BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(format!("ack of {tag} failed: {e}")))
    }

    async fn nack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.channel
            .basic_nack(
                tag.value(),
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Ack(format!("nack of {tag} failed: {e}")))
    }
}

fn map_delivery(delivery: lapin::message::Delivery) -> Delivery {
    // Quorum queues report prior deliveries in x-delivery-count; classic
    // queues only expose the redelivered flag, so the count is best-effort.
    let attempt = delivery_count(&delivery)
        .unwrap_or(if delivery.redelivered { 2 } else { 1 });
    Delivery {
        tag: DeliveryTag::new(delivery.delivery_tag),
        body: delivery.data,
        redelivered: delivery.redelivered,
        attempt,
    }
}

fn delivery_count(delivery: &lapin::message::Delivery) -> Option<u32> {
    let headers = delivery.properties.headers().as_ref()?;
    let value = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-delivery-count")
        .map(|(_, value)| value)?;
    let prior = match value {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok()?,
        AMQPValue::LongInt(n) => u32::try_from(*n).ok()?,
        AMQPValue::LongUInt(n) => *n,
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok()?,
        _ => return None,
    };
    Some(prior + 1)
}
