//! Environment-backed configuration.
//!
//! Components never read the process environment themselves. They receive
//! these structs at construction, so tests can run several simulated broker
//! endpoints side by side.

use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            broker: BrokerConfig::from_env(),
            server: ServerConfig::from_env(),
            consumer: ConsumerConfig::from_env(),
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  broker:    {}:{}", self.broker.host, self.broker.port);
        tracing::info!("  server:    {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  consumer:  retry_delay={}s, max_attempts={}",
            self.consumer.retry_delay_secs,
            self.consumer.max_delivery_attempts
        );
    }
}

// ── Broker ────────────────────────────────────────────────────

/// Where the message broker lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("RABBITMQ_HOST", "localhost"),
            port: env_u16("RABBITMQ_PORT", 5672),
        }
    }

    /// AMQP connection URI for this broker.
    pub fn amqp_uri(&self) -> String {
        format!("amqp://{}:{}/%2f", self.host, self.port)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
        }
    }
}

// ── HTTP server ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("SERVER_HOST", "0.0.0.0"),
            port: env_u16("SERVER_PORT", 8080),
        }
    }
}

// ── Consumer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Seconds between reconnection attempts while the broker is down.
    pub retry_delay_secs: u64,

    /// Deliveries after which a repeatedly failing message is dropped.
    /// 0 disables the cap.
    pub max_delivery_attempts: u32,

    /// Simulated processing time for the placeholder processor.
    pub processing_delay_ms: u64,
}

impl ConsumerConfig {
    pub fn from_env() -> Self {
        Self {
            retry_delay_secs: env_u64("CONSUMER_RETRY_DELAY_SECS", 5),
            max_delivery_attempts: env_u32("MAX_DELIVERY_ATTEMPTS", 5),
            processing_delay_ms: env_u64("PROCESSING_DELAY_MS", 2000),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 5,
            max_delivery_attempts: 5,
            processing_delay_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amqp_uri_format() {
        let broker = BrokerConfig {
            host: "rabbit.internal".to_string(),
            port: 5673,
        };
        assert_eq!(broker.amqp_uri(), "amqp://rabbit.internal:5673/%2f");
    }

    #[test]
    fn broker_defaults() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.host, "localhost");
        assert_eq!(broker.port, 5672);
    }

    #[test]
    fn consumer_defaults() {
        let consumer = ConsumerConfig::default();
        assert_eq!(consumer.retry_delay_secs, 5);
        assert_eq!(consumer.max_delivery_attempts, 5);
    }
}
