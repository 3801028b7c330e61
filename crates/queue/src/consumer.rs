//! Consumer lifecycle and delivery loop.
//!
//! A single sequential worker: one connection, prefetch 1, strict in-order
//! processing. Broker errors send it back to reconnecting; only an explicit
//! shutdown stops it. Horizontal scaling means running more worker
//! processes against the same durable queue, not more tasks in this one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use rohrpost_core::IngestionMessage;

use crate::backend::{Delivery, DeliveryStream, QueueBackend};
use crate::connection::{BackoffPolicy, ConnectionManager};
use crate::error::{ProcessingError, QueueError};

/// The processing collaborator. Deliberately a black box: it either
/// completes or fails, and the queue contract guarantees at-least-once
/// delivery, so implementations must tolerate duplicates.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, message: &IngestionMessage) -> Result<(), ProcessingError>;
}

/// Lifecycle states of a running consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Declaring,
    Consuming,
    Stopped,
}

/// Triggers a cooperative shutdown of the consumer it was taken from.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    /// Request shutdown. The consumer finishes any in-flight message,
    /// releases its connection, and stops pulling new work.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // notify_one stores a permit when the consumer is mid-processing,
        // so the signal is not lost between its cancellation checks.
        self.notify.notify_one();
    }
}

enum LoopExit {
    Shutdown,
    Reconnect,
}

pub struct Consumer {
    backend: Arc<dyn QueueBackend>,
    backoff: BackoffPolicy,
    queue: String,
    processor: Arc<dyn Processor>,
    max_delivery_attempts: u32,
    state: Mutex<ConsumerState>,
    stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Consumer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        queue: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            backend,
            backoff: BackoffPolicy::default(),
            queue: queue.into(),
            processor,
            max_delivery_attempts: 5,
            state: Mutex::new(ConsumerState::Disconnected),
            stop: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Override the reconnection delay schedule (default: fixed 5 s).
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the poison-message cap (default: 5, 0 disables).
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.stop.clone(),
            notify: self.shutdown.clone(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap() = state;
    }

    /// Run until shutdown. Broker errors never escape; they trigger a
    /// reconnection cycle instead.
    pub async fn run(&self) -> Result<(), QueueError> {
        let manager = ConnectionManager::new(self.backend.clone(), self.backoff.clone());

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            self.set_state(ConsumerState::Connecting);
            let conn = match manager.connect_with_retry(&self.shutdown).await {
                Ok(conn) => conn,
                Err(QueueError::Cancelled) => break,
                Err(e) => return Err(e),
            };

            self.set_state(ConsumerState::Declaring);
            let stream = match self.setup(conn.as_ref()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "queue setup failed, reconnecting");
                    let _ = conn.close().await;
                    self.set_state(ConsumerState::Disconnected);
                    if self.pause_before_reconnect().await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConsumerState::Consuming);
            info!(queue = %self.queue, "waiting for messages");

            let exit = self.consume_loop(stream).await;
            let _ = conn.close().await;
            match exit {
                LoopExit::Shutdown => break,
                LoopExit::Reconnect => {
                    self.set_state(ConsumerState::Disconnected);
                    if self.pause_before_reconnect().await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(queue = %self.queue, "consumer stopped");
        Ok(())
    }

    /// Declare the queue (durability must match the producer's flag) and
    /// open the prefetch-1 consume session.
    async fn setup(
        &self,
        conn: &dyn crate::backend::QueueConnection,
    ) -> Result<Box<dyn DeliveryStream>, QueueError> {
        conn.declare(&self.queue, true).await?;
        conn.consume(&self.queue, 1).await
    }

    /// Sleep one backoff step, or return `true` if shutdown fired first.
    async fn pause_before_reconnect(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff.delay(1)) => false,
            _ = self.shutdown.notified() => true,
        }
    }

    async fn consume_loop(&self, mut stream: Box<dyn DeliveryStream>) -> LoopExit {
        loop {
            // Cancellation is checked between messages, never mid-processing.
            if self.stop.load(Ordering::SeqCst) {
                return LoopExit::Shutdown;
            }

            let delivery = tokio::select! {
                result = stream.next() => match result {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(queue = %self.queue, error = %e, "delivery stream failed");
                        return LoopExit::Reconnect;
                    }
                },
                _ = self.shutdown.notified() => return LoopExit::Shutdown,
            };

            if let Err(e) = self.handle_delivery(stream.as_mut(), delivery).await {
                warn!(queue = %self.queue, error = %e, "broker error while settling delivery");
                return LoopExit::Reconnect;
            }
        }
    }

    async fn handle_delivery(
        &self,
        stream: &mut dyn DeliveryStream,
        delivery: Delivery,
    ) -> Result<(), QueueError> {
        // Poison guard: a message that keeps coming back gets dropped
        // instead of cycling through redelivery forever.
        if self.max_delivery_attempts > 0 && delivery.attempt > self.max_delivery_attempts {
            error!(
                tag = %delivery.tag,
                attempt = delivery.attempt,
                max = self.max_delivery_attempts,
                "delivery exceeded max attempts, dropping"
            );
            return stream.ack(delivery.tag).await;
        }

        let message = match IngestionMessage::from_bytes(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(tag = %delivery.tag, error = %e, "nacking undecodable message");
                return stream.nack(delivery.tag).await;
            }
        };

        match self.processor.process(&message).await {
            Ok(()) => {
                debug!(tag = %delivery.tag, source = %message.source, "message processed");
                stream.ack(delivery.tag).await
            }
            Err(e) => {
                // Not acknowledged: the broker redelivers it, here or to
                // another worker. At-least-once, by contract.
                warn!(
                    tag = %delivery.tag,
                    source = %message.source,
                    error = %e,
                    "processing failed, message left for redelivery"
                );
                stream.nack(delivery.tag).await
            }
        }
    }
}
