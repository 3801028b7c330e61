//! In-process queue backend.
//!
//! A stand-in broker with the same observable semantics as the real one:
//! FIFO order, idempotent declaration, persistent-until-acked messages,
//! per-connection prefetch enforcement, and requeue of unacknowledged
//! deliveries when their connection closes or drops. Used by tests and by
//! local development without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::backend::{Delivery, DeliveryStream, DeliveryTag, QueueBackend, QueueConnection};
use crate::error::QueueError;

/// A message held by the broker, with its delivery history.
#[derive(Debug)]
struct Stored {
    body: Vec<u8>,
    deliveries: u32,
}

#[derive(Default, Debug)]
struct QueueInner {
    ready: VecDeque<Stored>,
    /// tag → (owning connection, message). Entries move back to `ready`
    /// on nack or when the owning connection goes away.
    unacked: HashMap<u64, (u64, Stored)>,
    next_tag: u64,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

#[derive(Debug)]
struct BrokerInner {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    next_conn: AtomicU64,
    available: AtomicBool,
}

impl BrokerInner {
    /// Requeue every unacknowledged delivery owned by `conn_id`, across all
    /// queues. Models the broker noticing a dead consumer session.
    fn release_connection(&self, conn_id: u64) {
        let queues = self.queues.lock().unwrap();
        for state in queues.values() {
            let mut q = state.inner.lock().unwrap();
            let mut tags: Vec<u64> = q
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == conn_id)
                .map(|(tag, _)| *tag)
                .collect();
            if tags.is_empty() {
                continue;
            }
            // Requeue at the front, oldest delivery first.
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some((_, stored)) = q.unacked.remove(&tag) {
                    q.ready.push_front(stored);
                }
            }
            drop(q);
            state.notify.notify_waiters();
        }
    }
}

/// Process-local broker. Cloning yields a handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                next_conn: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate a broker outage (`false`) or recovery (`true`). While
    /// unavailable, new connections fail; existing ones keep working.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Messages currently owned by the named queue: ready plus unacked.
    /// Zero for a queue that was never declared.
    pub fn depth(&self, queue: &str) -> usize {
        let queues = self.inner.queues.lock().unwrap();
        queues
            .get(queue)
            .map(|state| {
                let q = state.inner.lock().unwrap();
                q.ready.len() + q.unacked.len()
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("broker unavailable".into()));
        }
        let id = self.inner.next_conn.fetch_add(1, Ordering::SeqCst);
        debug!(conn_id = id, "memory broker connection opened");
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
            id,
            open: AtomicBool::new(true),
        }))
    }
}

#[derive(Debug)]
struct MemoryConnection {
    inner: Arc<BrokerInner>,
    id: u64,
    open: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Connection("connection closed".into()))
        }
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.inner.queues.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl QueueConnection for MemoryConnection {
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut queues = self.inner.queues.lock().unwrap();
        match queues.get(queue) {
            Some(existing) if existing.durable != durable => Err(QueueError::Declare(format!(
                "queue '{queue}' exists with durable={}, redeclared with durable={durable}",
                existing.durable
            ))),
            Some(_) => Ok(()),
            None => {
                queues.insert(
                    queue.to_string(),
                    Arc::new(QueueState {
                        durable,
                        inner: Mutex::new(QueueInner::default()),
                        notify: Notify::new(),
                    }),
                );
                debug!(queue, durable, "queue declared");
                Ok(())
            }
        }
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.ensure_open()?;
        let state = self
            .queue(queue)
            .ok_or_else(|| QueueError::Publish(format!("queue '{queue}' does not exist")))?;
        {
            let mut q = state.inner.lock().unwrap();
            q.ready.push_back(Stored {
                body: payload.to_vec(),
                deliveries: 0,
            });
        }
        state.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn DeliveryStream>, QueueError> {
        self.ensure_open()?;
        let state = self
            .queue(queue)
            .ok_or_else(|| QueueError::Consume(format!("queue '{queue}' does not exist")))?;
        Ok(Box::new(MemoryStream {
            queue: state,
            conn_id: self.id,
            prefetch: prefetch as usize,
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.inner.release_connection(self.id);
            debug!(conn_id = self.id, "memory broker connection closed");
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    // A dropped connection behaves like a crashed consumer: the broker
    // requeues whatever it had not acknowledged.
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.inner.release_connection(self.id);
        }
    }
}

struct MemoryStream {
    queue: Arc<QueueState>,
    conn_id: u64,
    prefetch: usize,
}

impl MemoryStream {
    fn try_deliver(&self) -> Option<Delivery> {
        let mut q = self.queue.inner.lock().unwrap();
        let held = q
            .unacked
            .values()
            .filter(|(owner, _)| *owner == self.conn_id)
            .count();
        if held >= self.prefetch {
            return None;
        }
        let mut stored = q.ready.pop_front()?;
        stored.deliveries += 1;
        let tag = q.next_tag;
        q.next_tag += 1;
        let delivery = Delivery {
            tag: DeliveryTag::new(tag),
            body: stored.body.clone(),
            redelivered: stored.deliveries > 1,
            attempt: stored.deliveries,
        };
        q.unacked.insert(tag, (self.conn_id, stored));
        Some(delivery)
    }
}

#[async_trait]
impl DeliveryStream for MemoryStream {
    async fn next(&mut self) -> Result<Delivery, QueueError> {
        loop {
            // Register interest before checking, so a publish that lands
            // between the check and the await still wakes us.
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_deliver() {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        let mut q = self.queue.inner.lock().unwrap();
        match q.unacked.remove(&tag.value()) {
            Some((owner, _)) if owner == self.conn_id => Ok(()),
            Some(entry) => {
                // Not ours — put it back and reject the stale tag.
                q.unacked.insert(tag.value(), entry);
                Err(QueueError::Ack(format!("unknown delivery tag {tag}")))
            }
            None => Err(QueueError::Ack(format!("unknown delivery tag {tag}"))),
        }
    }

    async fn nack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        {
            let mut q = self.queue.inner.lock().unwrap();
            match q.unacked.remove(&tag.value()) {
                Some((owner, stored)) if owner == self.conn_id => {
                    q.ready.push_front(stored);
                }
                Some(entry) => {
                    q.unacked.insert(tag.value(), entry);
                    return Err(QueueError::Ack(format!("unknown delivery tag {tag}")));
                }
                None => return Err(QueueError::Ack(format!("unknown delivery tag {tag}"))),
            }
        }
        self.queue.notify.notify_waiters();
        Ok(())
    }
}
