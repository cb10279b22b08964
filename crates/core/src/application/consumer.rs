//! Listing Consumer - decode, validate, persist, settle
//!
//! Drives every delivery through decode -> validate -> persist and settles
//! it exactly once: ack after the record is stored, reject (no requeue) on
//! any failure. Rejected messages are gone for good.

use crate::application::constants::DEFAULT_SUBSCRIBE_RETRY_DELAY;
use crate::domain::{CarListing, StoredListing};
use crate::error::AppError;
use crate::port::message_source::{InboundMessage, MessageHandler, MessageSource};
use crate::port::record_store::RecordStore;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Consumes listing messages from the queue and persists the valid ones
pub struct ListingConsumer {
    me: Weak<ListingConsumer>,
    source: Arc<dyn MessageSource>,
    store: Arc<dyn RecordStore>,
    retry_delay: Duration,
    stopped: AtomicBool,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl ListingConsumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn RecordStore>,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            source,
            store,
            retry_delay,
            stopped: AtomicBool::new(false),
            retry_task: Mutex::new(None),
        })
    }

    pub fn with_default_delay(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn RecordStore>,
    ) -> Arc<Self> {
        Self::new(source, store, DEFAULT_SUBSCRIBE_RETRY_DELAY)
    }

    /// Attach to the message source. A failed attempt arms the retry timer
    /// instead of propagating: the broker may still be dialing.
    pub async fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("Ignoring start: consumer stopped");
            return;
        }

        let handler: Arc<dyn MessageHandler> = match self.me.upgrade() {
            Some(consumer) => consumer,
            None => return,
        };

        match self.source.subscribe(handler).await {
            Ok(()) => info!("Listing consumer started"),
            Err(e) => {
                warn!(error = %e, "Failed to start consuming, retry scheduled");
                self.schedule_restart();
            }
        }
    }

    /// Stop subscription attempts. In-flight deliveries finish on their
    /// own tasks.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.retry_task.lock().unwrap().take() {
            task.abort();
        }
        info!("Listing consumer stopped");
    }

    /// Arm the retry timer. Single slot: a live timer wins and the call
    /// becomes a no-op.
    fn schedule_restart(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut task = self.retry_task.lock().unwrap();
        if let Some(existing) = &*task {
            if !existing.is_finished() {
                debug!("Consumer retry already scheduled");
                return;
            }
        }

        let me = self.me.clone();
        let delay = self.retry_delay;
        *task = Some(tokio::spawn(async move {
            sleep(delay).await;
            let consumer = match me.upgrade() {
                Some(consumer) => consumer,
                None => return,
            };
            // Free the slot before the attempt so a failed attempt can
            // arm the next timer.
            consumer.retry_task.lock().unwrap().take();
            consumer.start().await;
        }));
        info!(delay_ms = %self.retry_delay.as_millis(), "Consumer retry scheduled");
    }

    /// Decode, validate and persist one payload
    async fn ingest(&self, payload: &[u8]) -> Result<StoredListing, AppError> {
        let value: Value = serde_json::from_slice(payload)?;
        let listing = CarListing::from_value(&value)?;
        let stored = self.store.create(&listing).await?;
        Ok(stored)
    }
}

#[async_trait]
impl MessageHandler for ListingConsumer {
    async fn handle(&self, message: InboundMessage) {
        match self.ingest(message.payload()).await {
            Ok(stored) => {
                debug!(
                    listing_id = %stored.id,
                    make = %stored.make,
                    model = %stored.model,
                    "Listing stored"
                );
                if let Err(e) = message.ack().await {
                    warn!(error = %e, "Failed to ack processed message");
                }
            }
            Err(e) => {
                match &e {
                    AppError::Validation(validation) => {
                        warn!(violations = %validation, "Discarding listing that failed validation");
                    }
                    AppError::Deserialization(_) => {
                        warn!(error = %e, "Discarding undecodable message");
                    }
                    _ => error!(error = %e, "Failed to process message"),
                }
                if let Err(reject_err) = message.reject().await {
                    warn!(error = %reject_err, "Failed to reject message");
                }
            }
        }
    }
}
