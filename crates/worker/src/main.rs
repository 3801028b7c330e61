//! rohrpost-worker — queue consumer process for the ingestion pipeline.
//!
//! Pulls one message at a time from the durable queue, processes it, and
//! acknowledges on success. Run several worker processes against the same
//! queue to scale out; the broker distributes messages between them.
//!
//! # Usage
//!
//! ```bash
//! # Local broker on default port
//! rohrpost-worker
//!
//! # Remote broker via flags or environment
//! rohrpost-worker --broker-host rabbit.internal --broker-port 5672
//! RABBITMQ_HOST=rabbit.internal rohrpost-worker
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::info;

use rohrpost_core::config::BrokerConfig;
use rohrpost_core::{IngestionMessage, INGESTION_QUEUE};
use rohrpost_queue::{
    AmqpBackend, BackoffPolicy, Consumer, ProcessingError, Processor, QueueBackend,
};

/// Queue consumer for the ingestion pipeline.
#[derive(Parser, Debug)]
#[command(name = "rohrpost-worker", version, about)]
struct Cli {
    /// Broker host.
    #[arg(long, env = "RABBITMQ_HOST", default_value = "localhost")]
    broker_host: String,

    /// Broker port.
    #[arg(long, env = "RABBITMQ_PORT", default_value_t = 5672)]
    broker_port: u16,

    /// Seconds between reconnection attempts while the broker is down.
    #[arg(long, env = "CONSUMER_RETRY_DELAY_SECS", default_value_t = 5)]
    retry_delay: u64,

    /// Deliveries after which a repeatedly failing message is dropped (0 = unlimited).
    #[arg(long, env = "MAX_DELIVERY_ATTEMPTS", default_value_t = 5)]
    max_delivery_attempts: u32,

    /// Simulated processing time in milliseconds.
    #[arg(long, env = "PROCESSING_DELAY_MS", default_value_t = 2000)]
    processing_delay_ms: u64,
}

/// Stand-in for the real processing pipeline: logs the message and sleeps.
/// Deliveries are at-least-once, so this must stay safe to run twice for
/// the same message.
struct SleepProcessor {
    delay: Duration,
}

#[async_trait]
impl Processor for SleepProcessor {
    async fn process(&self, message: &IngestionMessage) -> Result<(), ProcessingError> {
        info!(
            source = %message.source,
            timestamp = %message.timestamp,
            fields = message.data.len(),
            "processing message"
        );
        tokio::time::sleep(self.delay).await;
        info!(source = %message.source, "done processing");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // .env first, so clap's env fallbacks see it.
    rohrpost_core::config::load_dotenv();
    let cli = Cli::parse();
    info!(?cli, "starting rohrpost-worker");

    let backend: Arc<dyn QueueBackend> = Arc::new(AmqpBackend::new(BrokerConfig {
        host: cli.broker_host,
        port: cli.broker_port,
    }));
    let processor = Arc::new(SleepProcessor {
        delay: Duration::from_millis(cli.processing_delay_ms),
    });

    let consumer = Arc::new(
        Consumer::new(backend, INGESTION_QUEUE, processor)
            .with_backoff(BackoffPolicy::Fixed(Duration::from_secs(cli.retry_delay)))
            .with_max_delivery_attempts(cli.max_delivery_attempts),
    );

    // Bridge OS signals to the consumer's cooperative shutdown.
    let handle = consumer.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        handle.shutdown();
    });

    consumer.run().await?;
    info!("rohrpost-worker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[tokio::test]
    async fn sleep_processor_completes() {
        let processor = SleepProcessor {
            delay: Duration::from_millis(1),
        };
        let mut data = serde_json::Map::new();
        data.insert("x".to_string(), json!(1));
        let message = IngestionMessage::new(data, "test", "2024-01-01T00:00:00Z").unwrap();
        processor.process(&message).await.unwrap();
    }
}
