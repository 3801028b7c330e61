//! Connection lifecycle management.
//!
//! Producer and consumer both go through [`ConnectionManager`] before any
//! queue operation, but never share a live connection: each call to
//! [`ConnectionManager::connect`] or [`ConnectionManager::connect_with_retry`]
//! opens an independent one.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::backend::{QueueBackend, QueueConnection};
use crate::error::QueueError;

/// Observable state of the manager's most recent connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Delay schedule between reconnection attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// The same delay after every failed attempt.
    Fixed(Duration),
    /// Doubling delay, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl BackoffPolicy {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { initial, max } => {
                let exp = attempt.saturating_sub(1).min(16);
                (*initial * 2u32.saturating_pow(exp)).min(*max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(5))
    }
}

/// Opens and tracks connections to the queue backend.
///
/// Holds no message state: only the backend handle, the retry policy, and
/// the last observed [`ConnectionState`].
pub struct ConnectionManager {
    backend: Arc<dyn QueueBackend>,
    backoff: BackoffPolicy,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn QueueBackend>, backoff: BackoffPolicy) -> Self {
        Self {
            backend,
            backoff,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Single connection attempt. The producer path uses this: a failure
    /// surfaces immediately so the API boundary can respond promptly.
    pub async fn connect(&self) -> Result<Box<dyn QueueConnection>, QueueError> {
        self.set_state(ConnectionState::Connecting);
        match self.backend.connect().await {
            Ok(conn) => {
                self.set_state(ConnectionState::Connected);
                Ok(conn)
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Retry until connected or `shutdown` fires. The consumer path uses
    /// this: there is no upstream to redirect failures to, so it waits for
    /// the broker indefinitely.
    pub async fn connect_with_retry(
        &self,
        shutdown: &Notify,
    ) -> Result<Box<dyn QueueConnection>, QueueError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.set_state(ConnectionState::Connecting);
            match self.backend.connect().await {
                Ok(conn) => {
                    self.set_state(ConnectionState::Connected);
                    if attempt > 1 {
                        info!(attempt, "broker connection established after retries");
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    self.set_state(ConnectionState::Failed);
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker unavailable, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.notified() => {
                            self.set_state(ConnectionState::Disconnected);
                            return Err(QueueError::Cancelled);
                        }
                    }
                }
            }
        }
    }
}
