//! Carfeed Ingest Daemon - Main Entry Point
//! Consumes car listing messages from the broker and persists them.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Import workspace crates
use carfeed_core::application::{ConnectionManager, ListingConsumer};
use carfeed_core::config::BrokerConfig;
use carfeed_core::port::record_store::MemoryRecordStore;
use carfeed_core::port::time_provider::SystemTimeProvider;
use carfeed_infra_amqp::LapinConnector;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging (JSON for production, pretty for development)
    let log_format = std::env::var("CARFEED_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("carfeed=info"))
        .expect("Failed to create env filter");

    match log_format.as_str() {
        "json" => {
            // Production: JSON structured logging
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            // Development: Pretty formatting with colors
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    info!("Carfeed ingest daemon v{} starting...", VERSION);

    // 2. Load configuration
    let config = BrokerConfig::from_env();
    info!(
        url = %config.url,
        exchange = %config.exchange,
        queue = %config.queue,
        routing_key = %config.routing_key,
        "Broker configuration loaded"
    );

    // 3. Setup dependencies (DI wiring)
    let time_provider = Arc::new(SystemTimeProvider);
    let record_store = Arc::new(MemoryRecordStore::new(time_provider));
    let connector = Arc::new(LapinConnector);

    let manager = ConnectionManager::with_default_delay(connector, config);
    let consumer = ListingConsumer::with_default_delay(manager.clone(), record_store.clone());

    // 4. Bring the pipeline up. Neither call fails hard: with the broker
    //    unreachable the reconnect and retry timers take over.
    manager.initialize().await;
    consumer.start().await;

    info!("Ingest pipeline ready. Waiting for messages...");
    info!("Press Ctrl+C to shutdown");

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Exiting gracefully...");

    // 6. Graceful shutdown
    consumer.stop();
    manager.shutdown().await;

    info!(stored_listings = record_store.len(), "Shutdown complete.");

    Ok(())
}
