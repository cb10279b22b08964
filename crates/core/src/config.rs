// Broker Endpoint Configuration

use std::env;

// Defaults double as the wire contract shared with listing producers.
pub const DEFAULT_AMQP_URL: &str = "amqp://localhost:5672";
pub const DEFAULT_EXCHANGE: &str = "car_exchange";
pub const DEFAULT_QUEUE: &str = "car_queue";
pub const DEFAULT_ROUTING_KEY: &str = "car.new";

/// Immutable broker endpoint configuration, loaded once at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_AMQP_URL.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `CARFEED_AMQP_URL`, `CARFEED_EXCHANGE`,
    /// `CARFEED_QUEUE`, `CARFEED_ROUTING_KEY`.
    pub fn from_env() -> Self {
        Self {
            url: env_or("CARFEED_AMQP_URL", DEFAULT_AMQP_URL),
            exchange: env_or("CARFEED_EXCHANGE", DEFAULT_EXCHANGE),
            queue: env_or("CARFEED_QUEUE", DEFAULT_QUEUE),
            routing_key: env_or("CARFEED_ROUTING_KEY", DEFAULT_ROUTING_KEY),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
