//! Connection Manager - Broker session lifecycle
//!
//! Owns dialing, topology declaration, loss detection and timed reconnects.
//! At most one reconnect timer exists at a time, and shutdown is terminal:
//! every later lifecycle signal is ignored.

use crate::application::constants::{CONSUMER_TAG, DEFAULT_RECONNECT_DELAY};
use crate::config::BrokerConfig;
use crate::port::broker::{BrokerConnector, BrokerError, BrokerSession, DeliveryStream};
use crate::port::message_source::{MessageHandler, MessageSource};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Broker connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
    ShuttingDown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ReconnectScheduled => "reconnect_scheduled",
            ConnectionState::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manages one broker connection: dials, declares topology, detects loss
/// and schedules reconnects. Implements `MessageSource` so consumers can
/// attach a handler without seeing transport details.
pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    connector: Arc<dyn BrokerConnector>,
    config: BrokerConfig,
    reconnect_delay: Duration,
    shutting_down: AtomicBool,
    // Bumped each time a session is stored. Loss signals carry the
    // generation they were installed for, so a hook left over from a
    // replaced session cannot tear down its replacement.
    generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

struct Inner {
    session: Option<Arc<dyn BrokerSession>>,
    handler: Option<Arc<dyn MessageHandler>>,
    reconnect_task: Option<JoinHandle<()>>,
    consume_task: Option<JoinHandle<()>>,
    dialing: bool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        config: BrokerConfig,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connector,
            config,
            reconnect_delay,
            shutting_down: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            state_tx,
            inner: Mutex::new(Inner {
                session: None,
                handler: None,
                reconnect_task: None,
                consume_task: None,
                dialing: false,
            }),
        })
    }

    pub fn with_default_delay(
        connector: Arc<dyn BrokerConnector>,
        config: BrokerConfig,
    ) -> Arc<Self> {
        Self::new(connector, config, DEFAULT_RECONNECT_DELAY)
    }

    /// Establish a session and declare topology.
    ///
    /// Broker unavailability is not an error here: a failed attempt logs
    /// the cause and arms the reconnect timer, so startup succeeds with or
    /// without a reachable broker.
    pub async fn initialize(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Ignoring initialize: shutting down");
            return;
        }

        // One dial at a time; initialize on a live session is a no-op.
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.dialing || inner.session.is_some() {
                debug!("Ignoring initialize: dial in progress or session live");
                return;
            }
            inner.dialing = true;
        }

        self.set_state(ConnectionState::Connecting);
        info!(url = %self.config.url, "Connecting to broker");

        match self.open_session().await {
            Ok(session) => {
                // The dial may have raced shutdown; a session established
                // after the flag flipped must not survive.
                if self.shutting_down.load(Ordering::SeqCst) {
                    self.inner.lock().unwrap().dialing = false;
                    if let Err(e) = session.close().await {
                        warn!(error = %e, "Error closing session opened during shutdown");
                    }
                    return;
                }

                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.dialing = false;
                    inner.session = Some(session.clone());
                    self.generation.fetch_add(1, Ordering::SeqCst);
                }
                self.set_state(ConnectionState::Connected);
                info!(
                    exchange = %self.config.exchange,
                    queue = %self.config.queue,
                    routing_key = %self.config.routing_key,
                    "Broker connection established"
                );
                // The session is stored before the hook goes in: a loss
                // that already happened fires the hook during installation
                // and must find the session to clear.
                self.install_close_hook(&session);
                self.resume_consuming().await;
            }
            Err(e) => {
                self.inner.lock().unwrap().dialing = false;
                error!(error = %e, "Broker connection failed");
                self.schedule_reconnect();
            }
        }
    }

    /// Dial and declare. A session whose topology cannot be declared is
    /// useless and gets closed before the error propagates.
    async fn open_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let session = self.connector.connect(&self.config).await?;
        if let Err(e) = session.declare_topology(&self.config).await {
            if let Err(close_err) = session.close().await {
                warn!(error = %close_err, "Error closing session after declare failure");
            }
            return Err(e);
        }
        Ok(session)
    }

    fn install_close_hook(&self, session: &Arc<dyn BrokerSession>) {
        let me = self.me.clone();
        let generation = self.generation.load(Ordering::SeqCst);
        session.set_close_hook(Box::new(move || {
            if let Some(manager) = me.upgrade() {
                manager.connection_lost(generation);
            }
        }));
    }

    /// React to unsolicited session loss: drop the dead session, stop the
    /// delivery pump and arm the reconnect timer. A signal whose generation
    /// does not match the stored session is stale and gets dropped.
    fn connection_lost(&self, generation: u64) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if generation != self.generation.load(Ordering::SeqCst) {
                debug!("Ignoring loss signal from a replaced session");
                return;
            }
            inner.session = None;
            if let Some(task) = inner.consume_task.take() {
                task.abort();
            }
        }

        warn!("Broker connection lost");
        self.schedule_reconnect();
    }

    /// Arm the reconnect timer. Single slot: a live timer wins and the
    /// call becomes a no-op.
    fn schedule_reconnect(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!("Skipping reconnect: shutting down");
            return;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(task) = &inner.reconnect_task {
                if !task.is_finished() {
                    debug!("Reconnect already scheduled");
                    return;
                }
            }

            let me = self.me.clone();
            let delay = self.reconnect_delay;
            inner.reconnect_task = Some(tokio::spawn(async move {
                sleep(delay).await;
                let manager = match me.upgrade() {
                    Some(manager) => manager,
                    None => return,
                };
                // Free the slot before dialing so a failed attempt can
                // arm the next timer.
                manager.inner.lock().unwrap().reconnect_task.take();
                manager.initialize().await;
            }));
        }

        self.set_state(ConnectionState::ReconnectScheduled);
        info!(delay_ms = %self.reconnect_delay.as_millis(), "Reconnect scheduled");
    }

    /// Re-attach the registered handler after a reconnect. Without this a
    /// recovered session would sit idle while messages pile up in the queue.
    async fn resume_consuming(&self) {
        let handler = match self.inner.lock().unwrap().handler.clone() {
            Some(h) => h,
            None => return,
        };

        match self.start_consuming(handler).await {
            Ok(()) => info!(queue = %self.config.queue, "Consuming resumed"),
            Err(e) => {
                error!(error = %e, "Failed to resume consuming, recycling session");
                let session = self.inner.lock().unwrap().session.take();
                if let Some(session) = session {
                    if let Err(close_err) = session.close().await {
                        warn!(error = %close_err, "Error closing broker session");
                    }
                }
                self.schedule_reconnect();
            }
        }
    }

    /// Register a consumer on the live session and spawn the delivery pump.
    async fn start_consuming(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
        let (session, generation) = {
            let inner = self.inner.lock().unwrap();
            match inner.session.clone() {
                Some(s) => (s, self.generation.load(Ordering::SeqCst)),
                None => return Err(BrokerError::NotConnected),
            }
        };

        let stream = session.consume(&self.config.queue, CONSUMER_TAG).await?;

        let me = self.me.clone();
        let task = tokio::spawn(async move {
            Self::consume_loop(stream, handler, me, generation).await;
        });

        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.consume_task.replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// Pump deliveries into the handler until the stream dies, then report
    /// the loss. Each delivery runs on its own task so one stalled message
    /// cannot block the rest of the queue.
    async fn consume_loop(
        mut stream: DeliveryStream,
        handler: Arc<dyn MessageHandler>,
        me: Weak<ConnectionManager>,
        generation: u64,
    ) {
        loop {
            match stream.next().await {
                Some(Ok(message)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle(message).await;
                    });
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery stream failed");
                    break;
                }
                None => {
                    debug!("Delivery stream ended");
                    break;
                }
            }
        }

        if let Some(manager) = me.upgrade() {
            manager.connection_lost(generation);
        }
    }

    /// Terminal teardown: cancel timers, stop the delivery pump and close
    /// the session. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }

        self.set_state(ConnectionState::ShuttingDown);
        info!("Shutting down broker connection");

        let session = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            if let Some(task) = inner.consume_task.take() {
                task.abort();
            }
            inner.session.take()
        };

        if let Some(session) = session {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Error closing broker session");
            }
        }

        info!("Broker connection shut down");
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_modify(|current| {
            // ShuttingDown is terminal
            if *current != ConnectionState::ShuttingDown {
                *current = state;
            }
        });
    }
}

#[async_trait]
impl MessageSource for ConnectionManager {
    async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }

        // One consumer per manager; a second subscribe while delivery is
        // live is a harmless no-op.
        {
            let inner = self.inner.lock().unwrap();
            if let Some(task) = &inner.consume_task {
                if !task.is_finished() {
                    warn!("Subscribe ignored: consumer already active");
                    return Ok(());
                }
            }
        }

        self.start_consuming(handler.clone()).await?;

        // Stored only after a successful registration so a failed attempt
        // does not get resumed twice after reconnect.
        self.inner.lock().unwrap().handler = Some(handler);
        info!(queue = %self.config.queue, tag = %CONSUMER_TAG, "Consumer subscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::broker::mocks::{MockBehavior, MockConnector};
    use crate::port::message_source::mocks::delivery;
    use crate::port::message_source::InboundMessage;

    struct RecordingHandler {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(Vec::new()),
            })
        }

        fn payloads(&self) -> Vec<Vec<u8>> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: InboundMessage) {
            self.payloads.lock().unwrap().push(message.payload().to_vec());
            let _ = message.ack().await;
        }
    }

    fn manager_with(
        connector: Arc<MockConnector>,
        delay: Duration,
    ) -> Arc<ConnectionManager> {
        ConnectionManager::new(connector, BrokerConfig::default(), delay)
    }

    // Paused-clock sleep; returns once every ready task has run.
    async fn drain() {
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_establishes_session_and_declares_topology() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 1);

        let session = connector.last_session();
        assert_eq!(session.declare_count(), 1);
        assert_eq!(session.declared()[0], BrokerConfig::default());
        assert!(session.has_close_hook());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_on_live_session_is_noop() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;
        manager.initialize().await;

        assert_eq!(connector.attempts(), 1, "second initialize must not redial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dial_arms_reconnect_and_recovers() {
        let connector = Arc::new(MockConnector::new(MockBehavior::RefuseThenConnect(
            1,
            "connection refused".to_string(),
        )));
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;
        assert_eq!(manager.state(), ConnectionState::ReconnectScheduled);
        assert_eq!(connector.attempts(), 1);

        // Just before the timer fires nothing has happened yet
        sleep(Duration::from_millis(2_900)).await;
        assert_eq!(connector.attempts(), 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_timer_is_single_slot() {
        let connector = Arc::new(MockConnector::new_refusing("connection refused"));
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        // Two failed dials in a row must arm exactly one timer
        manager.initialize().await;
        manager.initialize().await;
        assert_eq!(connector.attempts(), 2);

        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(
            connector.attempts(),
            3,
            "one armed timer means one timed redial"
        );

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_retrying_while_broker_is_down() {
        let connector = Arc::new(MockConnector::new_refusing("connection refused"));
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;

        // Every period gets exactly one redial for as long as dials fail
        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(connector.attempts(), 2);
        sleep(Duration::from_secs(3)).await;
        assert_eq!(connector.attempts(), 3);
        sleep(Duration::from_secs(3)).await;
        assert_eq!(connector.attempts(), 4);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_armed_reconnect() {
        let connector = Arc::new(MockConnector::new_refusing("connection refused"));
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;
        assert_eq!(manager.state(), ConnectionState::ReconnectScheduled);

        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::ShuttingDown);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 1, "cancelled timer must not redial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_terminal() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;
        manager.shutdown().await;
        manager.shutdown().await;

        let session = connector.last_session();
        assert!(session.is_closed());
        assert_eq!(manager.state(), ConnectionState::ShuttingDown);

        // Lifecycle calls after shutdown are ignored
        manager.initialize().await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_without_session_is_not_connected() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector, Duration::from_secs(3));

        let result = manager.subscribe(RecordingHandler::new()).await;
        assert_eq!(result, Err(BrokerError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_delivers_messages_to_handler() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));
        let handler = RecordingHandler::new();

        manager.initialize().await;
        manager.subscribe(handler.clone()).await.unwrap();

        let session = connector.last_session();
        assert_eq!(session.consumers(), vec![(
            BrokerConfig::default().queue,
            CONSUMER_TAG.to_string()
        )]);

        let (message, probe) = delivery(b"{\"k\":1}");
        session.push_delivery(message);
        drain().await;

        assert_eq!(handler.payloads(), vec![b"{\"k\":1}".to_vec()]);
        assert!(probe.is_acked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_subscribe_is_noop_while_consumer_live() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;
        manager.subscribe(RecordingHandler::new()).await.unwrap();
        manager.subscribe(RecordingHandler::new()).await.unwrap();

        assert_eq!(connector.last_session().consume_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_reconnects_and_resumes_consumer() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));
        let handler = RecordingHandler::new();

        manager.initialize().await;
        manager.subscribe(handler.clone()).await.unwrap();

        connector.last_session().fire_close_hook();
        assert_eq!(manager.state(), ConnectionState::ReconnectScheduled);

        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.sessions().len(), 2);

        // The replacement session must be consuming without a new subscribe
        let replacement = connector.last_session();
        assert_eq!(replacement.consume_count(), 1);

        let (message, probe) = delivery(b"{\"after\":\"reconnect\"}");
        replacement.push_delivery(message);
        drain().await;

        assert_eq!(handler.payloads().len(), 1);
        assert!(probe.is_acked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_failure_triggers_reconnect() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;
        manager.subscribe(RecordingHandler::new()).await.unwrap();

        connector
            .last_session()
            .fail_stream(BrokerError::Connection("socket reset".to_string()));
        drain().await;

        assert_eq!(manager.state(), ConnectionState::ReconnectScheduled);

        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(connector.sessions().len(), 2);
        assert_eq!(connector.last_session().consume_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declare_failure_closes_session_and_schedules_reconnect() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        connector.fail_next_declares(1);
        manager.initialize().await;

        let first = connector.last_session();
        assert!(first.is_closed(), "half-open session must be closed");
        assert_eq!(manager.state(), ConnectionState::ReconnectScheduled);

        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.sessions().len(), 2);
        assert_eq!(connector.last_session().declare_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_failure_recycles_replacement_session() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        manager.initialize().await;
        manager.subscribe(RecordingHandler::new()).await.unwrap();

        // Replacement session accepts the dial but refuses the consume
        connector.fail_next_consumes(1);
        connector.last_session().fire_close_hook();

        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(connector.sessions().len(), 2);
        assert!(connector.last_session().is_closed());
        assert_eq!(manager.state(), ConnectionState::ReconnectScheduled);

        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(connector.sessions().len(), 3);
        assert_eq!(connector.last_session().consume_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_before_hook_installation_schedules_reconnect() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));

        // The session dies while the dial is still being wired up, before
        // any close hook exists to report it.
        connector.lose_next_session();
        manager.initialize().await;

        assert_eq!(
            manager.state(),
            ConnectionState::ReconnectScheduled,
            "pending loss must fire during hook installation"
        );

        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.sessions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_loss_signal_does_not_disturb_replacement_session() {
        let connector = Arc::new(MockConnector::new_connecting());
        let manager = manager_with(connector.clone(), Duration::from_secs(3));
        let handler = RecordingHandler::new();

        manager.initialize().await;
        manager.subscribe(handler.clone()).await.unwrap();

        let first = connector.last_session();
        first.fail_stream(BrokerError::Connection("socket reset".to_string()));
        drain().await;
        sleep(Duration::from_millis(3_100)).await;

        assert_eq!(connector.sessions().len(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);

        // The dead session still holds its hook. Firing it now must not
        // tear down the healthy replacement.
        first.fire_close_hook();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            connector.sessions().len(),
            2,
            "stale loss must not force a redial"
        );

        let replacement = connector.last_session();
        let (message, probe) = delivery(b"{\"still\":\"alive\"}");
        replacement.push_delivery(message);
        drain().await;

        assert_eq!(handler.payloads().len(), 1);
        assert!(probe.is_acked());
    }
}
