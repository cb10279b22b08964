// Broker Connection Port (Interface)
// Abstraction over the AMQP transport so the session lifecycle can be
// driven and observed in tests without a live broker.

use crate::config::BrokerConfig;
use crate::port::message_source::InboundMessage;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Broker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Consume setup failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Not connected to broker")]
    NotConnected,
}

/// Stream of deliveries for one consumer registration.
///
/// An `Err` item signals transport damage; the stream is dead once it
/// yields an error or ends.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<InboundMessage, BrokerError>> + Send>>;

/// Hook invoked when an established session is lost
pub type CloseHook = Box<dyn Fn() + Send + Sync>;

/// Dialer interface for opening broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a transport session against the configured endpoint
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// One established broker session (connection plus channel)
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare the exchange, queue and binding. Idempotent: redeclaring
    /// existing topology with identical attributes succeeds.
    async fn declare_topology(&self, config: &BrokerConfig) -> Result<(), BrokerError>;

    /// Register a consumer on `queue` and return its delivery stream
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Install the hook fired on unsolicited session loss.
    /// A deliberate `close` must not fire it, and implementations invoke
    /// it from within the async runtime. A loss that happened before the
    /// hook was installed fires it during installation.
    fn set_close_hook(&self, hook: CloseHook);

    /// Tear the session down deliberately
    async fn close(&self) -> Result<(), BrokerError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Mock connector behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Every dial succeeds
        Connect,
        /// Every dial fails
        Refuse(String),
        /// Fail the first N dials, then succeed
        RefuseThenConnect(usize, String),
    }

    /// Mock Broker Connector for testing the session lifecycle
    ///
    /// Hands out a fresh `MockSession` per successful dial and keeps every
    /// session for later inspection.
    pub struct MockConnector {
        behavior: Mutex<MockBehavior>,
        attempts: Mutex<usize>,
        sessions: Mutex<Vec<Arc<MockSession>>>,
        prime_declare_failures: Mutex<usize>,
        prime_consume_failures: Mutex<usize>,
        prime_lost: Mutex<bool>,
    }

    impl MockConnector {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                attempts: Mutex::new(0),
                sessions: Mutex::new(Vec::new()),
                prime_declare_failures: Mutex::new(0),
                prime_consume_failures: Mutex::new(0),
                prime_lost: Mutex::new(false),
            }
        }

        pub fn new_connecting() -> Self {
            Self::new(MockBehavior::Connect)
        }

        pub fn new_refusing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Refuse(message.into()))
        }

        /// Number of dial attempts so far
        pub fn attempts(&self) -> usize {
            *self.attempts.lock().unwrap()
        }

        /// All sessions handed out, oldest first
        pub fn sessions(&self) -> Vec<Arc<MockSession>> {
            self.sessions.lock().unwrap().clone()
        }

        /// Most recently established session
        pub fn last_session(&self) -> Arc<MockSession> {
            self.sessions
                .lock()
                .unwrap()
                .last()
                .expect("no session established")
                .clone()
        }

        /// The next session handed out fails its first `n` declares
        pub fn fail_next_declares(&self, n: usize) {
            *self.prime_declare_failures.lock().unwrap() = n;
        }

        /// The next session handed out fails its first `n` consumes
        pub fn fail_next_consumes(&self, n: usize) {
            *self.prime_consume_failures.lock().unwrap() = n;
        }

        /// The next session handed out is lost before any close hook can
        /// be installed on it
        pub fn lose_next_session(&self) {
            *self.prime_lost.lock().unwrap() = true;
        }
    }

    #[async_trait]
    impl BrokerConnector for MockConnector {
        async fn connect(
            &self,
            _config: &BrokerConfig,
        ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                *attempts
            };

            let behavior = self.behavior.lock().unwrap().clone();
            match behavior {
                MockBehavior::Connect => {}
                MockBehavior::Refuse(msg) => return Err(BrokerError::Connection(msg)),
                MockBehavior::RefuseThenConnect(n, msg) if attempt <= n => {
                    return Err(BrokerError::Connection(msg));
                }
                MockBehavior::RefuseThenConnect(..) => {}
            }

            let session = Arc::new(MockSession::new());
            {
                let mut primed = self.prime_declare_failures.lock().unwrap();
                if *primed > 0 {
                    session.fail_declares(*primed);
                    *primed = 0;
                }
            }
            {
                let mut primed = self.prime_consume_failures.lock().unwrap();
                if *primed > 0 {
                    session.fail_consumes(*primed);
                    *primed = 0;
                }
            }
            {
                let mut primed = self.prime_lost.lock().unwrap();
                if *primed {
                    session.signal_lost();
                    *primed = false;
                }
            }
            self.sessions.lock().unwrap().push(session.clone());
            Ok(session)
        }
    }

    /// Mock Broker Session
    ///
    /// Records declare/consume calls and lets tests inject deliveries,
    /// stream failures and unsolicited session loss.
    pub struct MockSession {
        declare_calls: Mutex<Vec<BrokerConfig>>,
        consume_calls: Mutex<Vec<(String, String)>>,
        declare_failures: Mutex<usize>,
        consume_failures: Mutex<usize>,
        delivery_tx: Mutex<Option<mpsc::UnboundedSender<Result<InboundMessage, BrokerError>>>>,
        close_hook: Mutex<Option<CloseHook>>,
        lost: AtomicBool,
        closed: AtomicBool,
    }

    impl MockSession {
        pub fn new() -> Self {
            Self {
                declare_calls: Mutex::new(Vec::new()),
                consume_calls: Mutex::new(Vec::new()),
                declare_failures: Mutex::new(0),
                consume_failures: Mutex::new(0),
                delivery_tx: Mutex::new(None),
                close_hook: Mutex::new(None),
                lost: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }
        }

        /// Fail the next `n` topology declarations
        pub fn fail_declares(&self, n: usize) {
            *self.declare_failures.lock().unwrap() = n;
        }

        /// Fail the next `n` consumer registrations
        pub fn fail_consumes(&self, n: usize) {
            *self.consume_failures.lock().unwrap() = n;
        }

        pub fn declare_count(&self) -> usize {
            self.declare_calls.lock().unwrap().len()
        }

        /// Topology configurations declared so far
        pub fn declared(&self) -> Vec<BrokerConfig> {
            self.declare_calls.lock().unwrap().clone()
        }

        pub fn consume_count(&self) -> usize {
            self.consume_calls.lock().unwrap().len()
        }

        /// (queue, consumer_tag) pairs registered so far
        pub fn consumers(&self) -> Vec<(String, String)> {
            self.consume_calls.lock().unwrap().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn has_close_hook(&self) -> bool {
            self.close_hook.lock().unwrap().is_some()
        }

        /// Inject one delivery into the active consumer stream
        pub fn push_delivery(&self, message: InboundMessage) {
            let tx = self.delivery_tx.lock().unwrap();
            tx.as_ref()
                .expect("no active consumer")
                .send(Ok(message))
                .expect("delivery stream dropped");
        }

        /// Inject a transport error into the active consumer stream
        pub fn fail_stream(&self, error: BrokerError) {
            let tx = self.delivery_tx.lock().unwrap();
            tx.as_ref()
                .expect("no active consumer")
                .send(Err(error))
                .expect("delivery stream dropped");
        }

        /// End the consumer stream (broker-side cancel)
        pub fn end_stream(&self) {
            self.delivery_tx.lock().unwrap().take();
        }

        /// Simulate unsolicited transport loss by firing the close hook
        pub fn fire_close_hook(&self) {
            let hook = self.close_hook.lock().unwrap().take();
            match hook {
                Some(hook) => hook(),
                None => panic!("no close hook installed"),
            }
        }

        /// Simulate transport loss as the transport sees it: fire the hook
        /// if one is installed, otherwise leave the loss pending so
        /// installation fires it.
        pub fn signal_lost(&self) {
            self.lost.store(true, Ordering::SeqCst);
            if let Some(hook) = self.close_hook.lock().unwrap().as_ref() {
                hook();
            }
        }
    }

    impl Default for MockSession {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl BrokerSession for MockSession {
        async fn declare_topology(&self, config: &BrokerConfig) -> Result<(), BrokerError> {
            {
                let mut failures = self.declare_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(BrokerError::Topology("mock declare failure".to_string()));
                }
            }
            self.declare_calls.lock().unwrap().push(config.clone());
            Ok(())
        }

        async fn consume(
            &self,
            queue: &str,
            consumer_tag: &str,
        ) -> Result<DeliveryStream, BrokerError> {
            {
                let mut failures = self.consume_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(BrokerError::Consume("mock consume failure".to_string()));
                }
            }

            self.consume_calls
                .lock()
                .unwrap()
                .push((queue.to_string(), consumer_tag.to_string()));

            let (tx, rx) = mpsc::unbounded_channel();
            *self.delivery_tx.lock().unwrap() = Some(tx);

            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(stream))
        }

        fn set_close_hook(&self, hook: CloseHook) {
            *self.close_hook.lock().unwrap() = Some(hook);
            if self.lost.load(Ordering::SeqCst) {
                if let Some(hook) = self.close_hook.lock().unwrap().as_ref() {
                    hook();
                }
            }
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.closed.store(true, Ordering::SeqCst);
            self.end_stream();
            Ok(())
        }
    }
}
