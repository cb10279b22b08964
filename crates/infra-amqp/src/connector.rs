//! lapin adapter for the broker ports
//!
//! One `LapinSession` wraps one connection plus one channel. Deliveries
//! carry their own one-shot acker, so settlement needs no tag bookkeeping
//! on the channel.

use async_trait::async_trait;
use carfeed_core::config::BrokerConfig;
use carfeed_core::port::broker::{
    BrokerConnector, BrokerError, BrokerSession, CloseHook, DeliveryStream,
};
use carfeed_core::port::message_source::{DeliveryAck, InboundMessage};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

// 200 = reply-success in AMQP 0.9.1
const CLOSE_REPLY_CODE: u16 = 200;
const CLOSE_REPLY_TEXT: &str = "shutdown";

/// Opens AMQP sessions with lapin
pub struct LapinConnector;

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let closing = Arc::new(AtomicBool::new(false));
        let lost = Arc::new(AtomicBool::new(false));
        let close_hook: Arc<Mutex<Option<CloseHook>>> = Arc::new(Mutex::new(None));

        // lapin reports every connection-level error here, including the
        // teardown of a deliberate close. The closing flag keeps deliberate
        // closes from looking like losses. The callback runs on lapin's own
        // executor thread, so the hook is bounced onto the tokio runtime.
        // The lost flag records errors that arrive before any hook is
        // installed; `set_close_hook` fires for those.
        {
            let closing = closing.clone();
            let lost = lost.clone();
            let close_hook = close_hook.clone();
            let runtime = tokio::runtime::Handle::current();
            connection.on_error(move |e| {
                if closing.load(Ordering::SeqCst) {
                    debug!(error = %e, "Ignoring connection error during close");
                    return;
                }
                error!(error = %e, "AMQP connection error");
                lost.store(true, Ordering::SeqCst);
                let close_hook = close_hook.clone();
                runtime.spawn(async move {
                    if let Some(hook) = close_hook.lock().unwrap().as_ref() {
                        hook();
                    }
                });
            });
        }

        debug!(url = %config.url, "AMQP connection open");
        Ok(Arc::new(LapinSession {
            connection,
            channel,
            closing,
            lost,
            close_hook,
        }))
    }
}

/// One established AMQP session (connection plus channel)
pub struct LapinSession {
    connection: Connection,
    channel: Channel,
    closing: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
    close_hook: Arc<Mutex<Option<CloseHook>>>,
}

#[async_trait]
impl BrokerSession for LapinSession {
    async fn declare_topology(&self, config: &BrokerConfig) -> Result<(), BrokerError> {
        // Declarations are passive-idempotent: redeclaring with identical
        // attributes succeeds, mismatched attributes fail the channel.
        self.channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        self.channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        self.channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                &config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        info!(
            exchange = %config.exchange,
            queue = %config.queue,
            routing_key = %config.routing_key,
            "Topology declared"
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        debug!(queue = %queue, tag = %consumer_tag, "Consumer registered");

        let stream = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(InboundMessage::new(
                delivery.data,
                Box::new(LapinAck {
                    acker: delivery.acker,
                }),
            )),
            Err(e) => Err(BrokerError::Connection(e.to_string())),
        });
        Ok(Box::pin(stream))
    }

    fn set_close_hook(&self, hook: CloseHook) {
        *self.close_hook.lock().unwrap() = Some(hook);
        // The connection may have died between connect and installation.
        if self.lost.load(Ordering::SeqCst) {
            warn!("Connection was lost before the close hook was installed");
            if let Some(hook) = self.close_hook.lock().unwrap().as_ref() {
                hook();
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closing.store(true, Ordering::SeqCst);

        // Channel first; a dead channel is survivable as long as the
        // connection still goes down cleanly.
        if let Err(e) = self.channel.close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT).await {
            warn!(error = %e, "Error closing AMQP channel");
        }
        self.connection
            .close(CLOSE_REPLY_CODE, CLOSE_REPLY_TEXT)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!("AMQP connection closed");
        Ok(())
    }
}

/// One-shot settlement handle backed by the delivery's acker
struct LapinAck {
    acker: Acker,
}

#[async_trait]
impl DeliveryAck for LapinAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        // No requeue: a refused message is dropped for good
        self.acker
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_dial_maps_to_connection_error() {
        let connector = LapinConnector;
        let config = BrokerConfig {
            url: "amqp://127.0.0.1:1".to_string(),
            ..BrokerConfig::default()
        };

        let result = connector.connect(&config).await;
        match result {
            Err(BrokerError::Connection(_)) => {}
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
    }
}
