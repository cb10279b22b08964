// Message Source Port (Interface)

use crate::port::broker::BrokerError;
use async_trait::async_trait;
use std::sync::Arc;

/// Settlement half of one delivery.
///
/// Consuming receivers make settlement one-shot: the handle is gone after
/// either call.
#[async_trait]
pub trait DeliveryAck: Send + Sync {
    /// Confirm successful processing; the broker discards the message
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Refuse the message without requeueing; the broker drops it for good
    async fn reject(self: Box<Self>) -> Result<(), BrokerError>;
}

/// One message delivered from the broker, paired with its settlement handle
pub struct InboundMessage {
    payload: Vec<u8>,
    ack: Box<dyn DeliveryAck>,
}

impl InboundMessage {
    pub fn new(payload: Vec<u8>, ack: Box<dyn DeliveryAck>) -> Self {
        Self { payload, ack }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Settle positively. Consumes the message: a settled delivery cannot
    /// be settled again.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.ack.ack().await
    }

    /// Settle negatively without requeue. The broker drops the message
    /// permanently.
    pub async fn reject(self) -> Result<(), BrokerError> {
        self.ack.reject().await
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Handler interface for consuming deliveries
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. The handler owns settlement: it must ack or
    /// reject `message` exactly once.
    async fn handle(&self, message: InboundMessage);
}

/// Source interface for attaching a handler to the configured queue
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Begin delivering queue messages to `handler`.
    ///
    /// # Errors
    /// - `BrokerError::NotConnected` if no session is established
    /// - `BrokerError::Consume` if consumer registration fails
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Terminal settlement of one delivery
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum AckOutcome {
        Acked,
        Rejected,
    }

    /// Observer handle paired with a `RecordingAck`
    #[derive(Clone)]
    pub struct AckProbe {
        outcome: Arc<Mutex<Option<AckOutcome>>>,
    }

    impl AckProbe {
        pub fn outcome(&self) -> Option<AckOutcome> {
            *self.outcome.lock().unwrap()
        }

        pub fn is_acked(&self) -> bool {
            self.outcome() == Some(AckOutcome::Acked)
        }

        pub fn is_rejected(&self) -> bool {
            self.outcome() == Some(AckOutcome::Rejected)
        }

        pub fn is_settled(&self) -> bool {
            self.outcome().is_some()
        }
    }

    /// Recording acknowledger for testing
    pub struct RecordingAck {
        outcome: Arc<Mutex<Option<AckOutcome>>>,
        fail: bool,
    }

    impl RecordingAck {
        pub fn new() -> (Box<Self>, AckProbe) {
            Self::with_failure(false)
        }

        /// Settlement records its outcome but reports a broker error
        pub fn failing() -> (Box<Self>, AckProbe) {
            Self::with_failure(true)
        }

        fn with_failure(fail: bool) -> (Box<Self>, AckProbe) {
            let outcome = Arc::new(Mutex::new(None));
            let probe = AckProbe {
                outcome: outcome.clone(),
            };
            (Box::new(Self { outcome, fail }), probe)
        }
    }

    #[async_trait]
    impl DeliveryAck for RecordingAck {
        async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
            *self.outcome.lock().unwrap() = Some(AckOutcome::Acked);
            if self.fail {
                return Err(BrokerError::Ack("mock ack failure".to_string()));
            }
            Ok(())
        }

        async fn reject(self: Box<Self>) -> Result<(), BrokerError> {
            *self.outcome.lock().unwrap() = Some(AckOutcome::Rejected);
            if self.fail {
                return Err(BrokerError::Ack("mock reject failure".to_string()));
            }
            Ok(())
        }
    }

    /// Build a delivery carrying `payload` with a recording acknowledger
    pub fn delivery(payload: &[u8]) -> (InboundMessage, AckProbe) {
        let (ack, probe) = RecordingAck::new();
        (InboundMessage::new(payload.to_vec(), ack), probe)
    }

    /// Same as `delivery`, but settlement reports a broker error
    pub fn delivery_with_failing_ack(payload: &[u8]) -> (InboundMessage, AckProbe) {
        let (ack, probe) = RecordingAck::failing();
        (InboundMessage::new(payload.to_vec(), ack), probe)
    }

    /// Mock source behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Accept every subscription
        Accept,
        /// Refuse every subscription
        Refuse(BrokerError),
        /// Refuse the first N subscriptions, then accept
        RefuseTimes(usize, BrokerError),
    }

    /// Mock Message Source for testing consumer wiring
    pub struct MockMessageSource {
        behavior: Mutex<MockBehavior>,
        handler: Mutex<Option<Arc<dyn MessageHandler>>>,
        call_count: Mutex<usize>,
    }

    impl MockMessageSource {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                handler: Mutex::new(None),
                call_count: Mutex::new(0),
            }
        }

        pub fn new_accepting() -> Self {
            Self::new(MockBehavior::Accept)
        }

        pub fn call_count(&self) -> usize {
            *self.call_count.lock().unwrap()
        }

        /// Handler captured by the last successful subscription
        pub fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
            self.handler.lock().unwrap().clone()
        }

        /// Drive one delivery through the subscribed handler
        pub async fn deliver(&self, message: InboundMessage) {
            let handler = self.handler().expect("no handler subscribed");
            handler.handle(message).await;
        }
    }

    #[async_trait]
    impl MessageSource for MockMessageSource {
        async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
            let count = {
                let mut count = self.call_count.lock().unwrap();
                *count += 1;
                *count
            };

            let behavior = self.behavior.lock().unwrap().clone();
            match behavior {
                MockBehavior::Accept => {}
                MockBehavior::Refuse(err) => return Err(err),
                MockBehavior::RefuseTimes(n, err) if count <= n => return Err(err),
                MockBehavior::RefuseTimes(..) => {}
            }

            *self.handler.lock().unwrap() = Some(handler);
            Ok(())
        }
    }
}
