//! Proxy Controller: the single owner of proxy state
//!
//! Everything that mutates state runs on the controller's event loop:
//! commands from [`ProxyHandle`]s, broker frames, negotiation events and
//! timers all arrive as [`ProxyEvent`]s and are handled one at a time.
//! Background tasks (broker I/O, timers, the negotiation primitive) only
//! ever post events.

pub mod scheduler;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerClient, BrokerClientConfig, BrokerDialer, BrokerError, BrokerEvent, BrokerMessage,
    RetryDecision,
};
use crate::config::{ConfigError, ProxyConfig};
use crate::manager::{AnswerRoute, SessionManager, SessionOutcome};
use crate::nat::{NatClassifier, NatType};
use crate::negotiation::{Negotiator, SessionEvent};
use crate::notify::{notices, Notifier};
use crate::session::SessionId;
use crate::store::{PersistedState, StateStore};

pub use scheduler::{Scheduler, TimerKind};

// ============================================================================
// EVENTS & ERRORS
// ============================================================================

/// Everything the event loop reacts to
#[derive(Debug)]
pub enum ProxyEvent {
    /// Reported by the negotiation primitive for one session
    Session { id: SessionId, event: SessionEvent },
    /// From the broker connection of the given generation
    Broker { generation: u64, event: BrokerEvent },
    /// A timer of the given scheduler generation fired
    Timer { generation: u64, timer: TimerKind },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Broker connection failed: {0}")]
    Broker(#[from] BrokerError),
    #[error("Proxy controller is not running")]
    ControllerGone,
}

// ============================================================================
// COUNTERS
// ============================================================================

/// Visible proxy status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Stopped,
    Starting,
    Running,
    Reconnecting,
    BrokerUnavailable,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Starting => "starting",
            ProxyStatus::Running => "running",
            ProxyStatus::Reconnecting => "reconnecting",
            ProxyStatus::BrokerUnavailable => "broker unavailable",
        };
        f.write_str(s)
    }
}

/// Snapshot of the proxy's counters, published on every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub enabled: bool,
    pub total_helped: u64,
    pub alltime_uptime_secs: u64,
    pub nat_type: NatType,
    pub active_sessions: usize,
    pub status: ProxyStatus,
    pub bytes_relayed: u64,
}

// ============================================================================
// HANDLE
// ============================================================================

#[derive(Debug)]
enum Command {
    Start(oneshot::Sender<Result<(), ProxyError>>),
    Stop(oneshot::Sender<()>),
    Stats(oneshot::Sender<Counters>),
    Shutdown,
}

/// Cloneable remote control for a running controller
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    commands: mpsc::UnboundedSender<Command>,
    counters: broadcast::Sender<Counters>,
}

impl ProxyHandle {
    pub async fn start(&self) -> Result<(), ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start(tx))
            .map_err(|_| ProxyError::ControllerGone)?;
        rx.await.map_err(|_| ProxyError::ControllerGone)?
    }

    pub async fn stop(&self) -> Result<(), ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(tx))
            .map_err(|_| ProxyError::ControllerGone)?;
        rx.await.map_err(|_| ProxyError::ControllerGone)
    }

    pub async fn stats(&self) -> Result<Counters, ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| ProxyError::ControllerGone)?;
        rx.await.map_err(|_| ProxyError::ControllerGone)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Counters> {
        self.counters.subscribe()
    }

    /// Stop the event loop without touching the persisted toggle
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

const COUNTERS_CAPACITY: usize = 64;

pub struct ProxyController {
    config: ProxyConfig,
    state: PersistedState,
    store: StateStore,
    notifier: Arc<dyn Notifier>,
    classifier: NatClassifier,
    broker: BrokerClient,
    manager: SessionManager,
    scheduler: Scheduler,
    status: ProxyStatus,
    /// Whether this run has announced itself and started the uptime tick
    running_announced: bool,
    events: mpsc::UnboundedReceiver<ProxyEvent>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    counters: broadcast::Sender<Counters>,
}

impl ProxyController {
    pub fn new(
        config: ProxyConfig,
        negotiator: Arc<dyn Negotiator>,
        dialer: Arc<dyn BrokerDialer>,
        store: StateStore,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (counters, _) = broadcast::channel(COUNTERS_CAPACITY);

        let state = store.load();
        debug!("Loaded proxy state: {:?}", state);

        let broker = BrokerClient::new(
            BrokerClientConfig::from(&config),
            dialer,
            events_tx.clone(),
        );
        let manager = SessionManager::new(
            Arc::clone(&negotiator),
            events_tx.clone(),
            config.max_num_clients,
            config.negotiation_timeout,
        );

        Ok(Self {
            classifier: NatClassifier::new(negotiator),
            scheduler: Scheduler::new(events_tx),
            config,
            state,
            store,
            notifier,
            broker,
            manager,
            status: ProxyStatus::Stopped,
            running_announced: false,
            events,
            commands_tx,
            commands,
            counters,
        })
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            commands: self.commands_tx.clone(),
            counters: self.counters.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Counters> {
        self.counters.subscribe()
    }

    pub fn stats(&self) -> Counters {
        Counters {
            enabled: self.state.enabled,
            total_helped: self.state.total_helped,
            alltime_uptime_secs: self.state.alltime_uptime_secs,
            nat_type: self.state.nat_type,
            active_sessions: self.manager.active_sessions(),
            status: self.status,
            bytes_relayed: self.manager.bytes_relayed(),
        }
    }

    pub fn status(&self) -> ProxyStatus {
        self.status
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Enable the proxy: classify NAT, connect the broker, begin serving.
    ///
    /// A broker failure is returned but leaves the proxy enabled with a
    /// retry scheduled.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        if self.state.enabled {
            match self.status {
                ProxyStatus::Starting | ProxyStatus::Running | ProxyStatus::Reconnecting => {
                    debug!("Proxy already started ({})", self.status);
                    return Ok(());
                }
                ProxyStatus::BrokerUnavailable => {
                    info!("Retrying unavailable broker");
                    self.broker.close();
                    self.set_status(ProxyStatus::Reconnecting);
                    return self.connect_broker().await;
                }
                ProxyStatus::Stopped => {}
            }
        }

        info!("Starting proxy");
        self.scheduler.cancel_all();
        self.manager.reset_throughput();
        self.running_announced = false;
        self.state.enabled = true;
        self.persist(|store, state| store.set_enabled(state.enabled));
        self.set_status(ProxyStatus::Starting);

        let nat_type = self.classifier.classify(self.config.probe_timeout).await;
        self.state.nat_type = nat_type;
        self.persist(|store, state| store.set_nat_type(state.nat_type));
        self.publish();

        let result = self.connect_broker().await;
        if result.is_err() {
            self.notify(notices::TITLE_ERROR, notices::BODY_START_FAILED);
        }
        result
    }

    /// Disable the proxy and tear everything down
    pub fn stop(&mut self) {
        if !self.state.enabled {
            debug!("Proxy already stopped");
            return;
        }
        info!("Stopping proxy");
        self.state.enabled = false;
        self.persist(|store, state| store.set_enabled(state.enabled));
        self.teardown();
        self.notify(notices::TITLE_STOPPED, notices::BODY_STOPPED);
        self.publish();
    }

    /// Run until a handle asks for shutdown. Resumes serving if the
    /// persisted toggle says the proxy was enabled.
    pub async fn run(mut self) {
        if self.state.enabled {
            info!("Proxy was enabled, resuming");
            if let Err(e) = self.start().await {
                warn!("Resume failed: {}", e);
            }
        }

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    match command {
                        Command::Start(reply) => {
                            let _ = reply.send(self.start().await);
                        }
                        Command::Stop(reply) => {
                            self.stop();
                            let _ = reply.send(());
                        }
                        Command::Stats(reply) => {
                            let _ = reply.send(self.stats());
                        }
                        Command::Shutdown => break,
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }
                else => break,
            }
        }

        info!("Proxy controller shutting down");
        self.teardown();
    }

    /// Wait for and handle the next queued event
    pub async fn step(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle_event(&mut self, event: ProxyEvent) {
        match event {
            ProxyEvent::Session { id, event } => self.on_session_event(id, event).await,
            ProxyEvent::Broker { generation, event } => {
                self.on_broker_event(generation, event).await
            }
            ProxyEvent::Timer { generation, timer } => {
                if !self.scheduler.is_current(generation) {
                    debug!("Dropping stale timer {:?}", timer);
                    return;
                }
                self.on_timer(timer).await
            }
        }
    }

    fn teardown(&mut self) {
        self.broker.close();
        self.scheduler.cancel_all();
        self.running_announced = false;
        self.manager.shutdown();
        self.set_status(ProxyStatus::Stopped);
    }

    // ------------------------------------------------------------------------
    // Broker
    // ------------------------------------------------------------------------

    async fn connect_broker(&mut self) -> Result<(), ProxyError> {
        match self.broker.connect().await {
            Ok(()) => {
                self.on_broker_connected().await;
                Ok(())
            }
            Err(e) => match self.on_connect_failed() {
                RetryDecision::RetryIn(_) => Err(ProxyError::Broker(e)),
                RetryDecision::GiveUp => Err(ProxyError::Broker(BrokerError::Unavailable(
                    self.broker.retry_count(),
                ))),
            },
        }
    }

    fn on_connect_failed(&mut self) -> RetryDecision {
        let decision = self.broker.record_failure();
        match decision {
            RetryDecision::RetryIn(delay) => {
                info!(
                    "Broker retry {}/{} in {:?}",
                    self.broker.retry_count(),
                    self.config.max_retries,
                    delay
                );
                self.scheduler.after(delay, TimerKind::Reconnect);
                self.set_status(ProxyStatus::Reconnecting);
            }
            RetryDecision::GiveUp => {
                error!(
                    "Broker unavailable after {} attempts, giving up",
                    self.broker.retry_count()
                );
                self.set_status(ProxyStatus::BrokerUnavailable);
                self.notify(notices::TITLE_UNAVAILABLE, notices::BODY_UNAVAILABLE);
            }
        }
        self.publish();
        decision
    }

    async fn on_broker_connected(&mut self) {
        self.set_status(ProxyStatus::Running);

        for pending in self.manager.resend_offers() {
            self.send_offer(pending.id, &pending.offer, pending.epoch);
        }
        self.fill().await;

        if !self.running_announced {
            self.running_announced = true;
            self.scheduler
                .every(self.config.uptime_tick, TimerKind::Uptime);
            self.notify(notices::TITLE_STARTED, notices::BODY_STARTED);
        }
        self.publish();
    }

    async fn on_broker_event(&mut self, generation: u64, event: BrokerEvent) {
        match event {
            BrokerEvent::Closed => {
                if !self.broker.on_closed(generation) {
                    return;
                }
                if self.state.enabled {
                    let delay = self.broker.backoff_for(self.broker.retry_count());
                    warn!("Broker connection lost, reconnecting in {:?}", delay);
                    self.scheduler.after(delay, TimerKind::Reconnect);
                    self.set_status(ProxyStatus::Reconnecting);
                    self.publish();
                }
            }
            BrokerEvent::Message(text) => {
                if !self.broker.is_current(generation) {
                    debug!("Dropping frame from superseded broker connection");
                    return;
                }
                match BrokerMessage::parse_inbound(&text) {
                    Ok(Some(BrokerMessage::Answer {
                        id,
                        answer,
                        candidates,
                    })) => {
                        let route = self
                            .manager
                            .route_answer(id.as_deref(), &answer, &candidates)
                            .await;
                        match route {
                            AnswerRoute::Applied(id) => {
                                debug!("Answer applied to {}", id);
                                self.scheduler.after(
                                    self.config.datachannel_timeout,
                                    TimerKind::ChannelTimeout { id },
                                );
                            }
                            AnswerRoute::Failed(id) => {
                                warn!("Session {} rejected its answer", id);
                                self.after_termination();
                            }
                            AnswerRoute::Unmatched => {}
                        }
                    }
                    Ok(Some(other)) => {
                        debug!("Ignoring inbound {}", other.message_type());
                    }
                    Ok(None) => debug!("Ignoring unrecognized broker message"),
                    Err(e) => warn!("Dropping broker message: {}", e),
                }
            }
        }
    }

    fn send_offer(&mut self, id: SessionId, offer: &BrokerMessage, epoch: u32) {
        match self.broker.send(offer) {
            Ok(()) => {
                self.scheduler.after(
                    self.config.datachannel_timeout,
                    TimerKind::AnswerTimeout { id, epoch },
                );
            }
            Err(e) => debug!("Offer for {} held until reconnect: {}", id, e),
        }
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    async fn fill(&mut self) {
        if let Err(e) = self.manager.fill(self.state.nat_type).await {
            warn!("Failed to create session: {}", e);
            self.scheduler
                .after(self.config.retry_interval, TimerKind::Replace);
        }
    }

    async fn on_session_event(&mut self, id: SessionId, event: SessionEvent) {
        match self.manager.handle_event(id, event) {
            SessionOutcome::Ignored | SessionOutcome::Updated => {}
            SessionOutcome::OfferReady { offer, epoch } => {
                self.send_offer(id, &offer, epoch);
            }
            SessionOutcome::Activated => {
                self.state.total_helped = self.state.total_helped.saturating_add(1);
                self.persist(|store, state| store.set_total_helped(state.total_helped));
                self.notify(
                    notices::TITLE_NEW_CONNECTION,
                    &notices::serving_client(self.state.total_helped),
                );
                self.publish();
            }
            SessionOutcome::Terminated => self.after_termination(),
        }
    }

    fn after_termination(&mut self) {
        if self.state.enabled && self.manager.has_capacity() {
            self.scheduler
                .after(self.config.replacement_delay, TimerKind::Replace);
        }
        self.publish();
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    async fn on_timer(&mut self, timer: TimerKind) {
        if !self.state.enabled {
            return;
        }
        match timer {
            TimerKind::Uptime => {
                self.state.alltime_uptime_secs = self
                    .state
                    .alltime_uptime_secs
                    .saturating_add(self.config.uptime_tick.as_secs());
                self.persist(|store, state| store.set_alltime_uptime(state.alltime_uptime_secs));
                self.publish();
            }
            TimerKind::Reconnect => {
                if self.broker.is_connected() {
                    return;
                }
                if let Err(e) = self.connect_broker().await {
                    debug!("Reconnect failed: {}", e);
                }
            }
            TimerKind::Replace => {
                if !self.broker.is_connected() || !self.manager.has_capacity() {
                    return;
                }
                match self.manager.admit(self.state.nat_type).await {
                    Ok(_) => self.publish(),
                    Err(e) => {
                        warn!("Failed to create replacement session: {}", e);
                        self.scheduler
                            .after(self.config.retry_interval, TimerKind::Replace);
                    }
                }
            }
            TimerKind::AnswerTimeout { id, epoch } => {
                // Offers held across a broker outage are resent with a
                // fresh deadline.
                if !self.broker.is_connected() {
                    return;
                }
                if self.manager.expire_answer(id, epoch) {
                    info!("Session {} got no answer in time", id);
                    self.after_termination();
                }
            }
            TimerKind::ChannelTimeout { id } => {
                if self.manager.expire_negotiation(id) {
                    info!("Session {} never opened its data channel", id);
                    self.after_termination();
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Side effects
    // ------------------------------------------------------------------------

    fn set_status(&mut self, status: ProxyStatus) {
        if self.status != status {
            debug!("Proxy status {} -> {}", self.status, status);
            self.status = status;
        }
    }

    fn publish(&self) {
        // No subscribers is fine.
        let _ = self.counters.send(self.stats());
    }

    fn persist<F>(&self, write: F)
    where
        F: FnOnce(&StateStore, &PersistedState) -> Result<(), crate::store::StoreError>,
    {
        if let Err(e) = write(&self.store, &self.state) {
            warn!("Failed to persist proxy state: {}", e);
        }
    }

    fn notify(&self, title: &str, body: &str) {
        if let Err(e) = self.notifier.notify(title, body) {
            warn!("Notification failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSink, BrokerStream};
    use crate::negotiation::{NegotiationError, NegotiationHandle};
    use crate::notify::MockNotifier;
    use crate::store::MemoryStorage;
    use async_trait::async_trait;

    struct NoPeers;

    #[async_trait]
    impl Negotiator for NoPeers {
        async fn create_session(
            &self,
            _events: crate::negotiation::EventSink,
        ) -> Result<Box<dyn NegotiationHandle>, NegotiationError> {
            Err(NegotiationError::CreateFailed("unsupported".to_string()))
        }
    }

    struct RefusingDialer;

    #[async_trait]
    impl BrokerDialer for RefusingDialer {
        async fn dial(
            &self,
            _endpoint: &str,
        ) -> Result<(Box<dyn BrokerSink>, Box<dyn BrokerStream>), BrokerError> {
            Err(BrokerError::ConnectFailed("refused".to_string()))
        }
    }

    fn controller(notifier: MockNotifier, memory: MemoryStorage) -> ProxyController {
        ProxyController::new(
            ProxyConfig::default(),
            Arc::new(NoPeers),
            Arc::new(RefusingDialer),
            StateStore::new(Arc::new(memory)),
            Arc::new(notifier),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_stays_enabled_and_swallows_notifier_errors() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .returning(|_, _| Err("no notification daemon".to_string()));

        let memory = MemoryStorage::new();
        let mut proxy = controller(notifier, memory.clone());

        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Broker(_)));
        assert!(proxy.stats().enabled);
        assert_eq!(proxy.status(), ProxyStatus::Reconnecting);
        assert!(StateStore::new(Arc::new(memory)).load().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_stopped_is_silent() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let mut proxy = controller(notifier, MemoryStorage::new());
        proxy.stop();
        assert_eq!(proxy.status(), ProxyStatus::Stopped);
        assert!(!proxy.stats().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_notifies_once() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|title, _| title.to_string() == notices::TITLE_STOPPED)
            .times(1)
            .returning(|_, _| Ok(()));
        notifier
            .expect_notify()
            .withf(|title, _| title.to_string() != notices::TITLE_STOPPED)
            .returning(|_, _| Ok(()));

        let mut proxy = controller(notifier, MemoryStorage::new());
        let _ = proxy.start().await;
        proxy.stop();
        proxy.stop();
        assert_eq!(proxy.status(), ProxyStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retry_budget_reports_unavailable() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|title, _| title.to_string() == notices::TITLE_UNAVAILABLE)
            .times(1)
            .returning(|_, _| Ok(()));
        notifier
            .expect_notify()
            .withf(|title, _| title.to_string() != notices::TITLE_UNAVAILABLE)
            .returning(|_, _| Ok(()));

        let config = ProxyConfig {
            max_retries: 1,
            ..Default::default()
        };
        let mut proxy = ProxyController::new(
            config,
            Arc::new(NoPeers),
            Arc::new(RefusingDialer),
            StateStore::new(Arc::new(MemoryStorage::new())),
            Arc::new(notifier),
        )
        .unwrap();

        let err = proxy.start().await.unwrap_err();
        assert_eq!(err, ProxyError::Broker(BrokerError::Unavailable(1)));
        assert_eq!(proxy.status(), ProxyStatus::BrokerUnavailable);
        assert!(proxy.stats().enabled);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ProxyConfig {
            max_num_clients: 0,
            ..Default::default()
        };
        let result = ProxyController::new(
            config,
            Arc::new(NoPeers),
            Arc::new(RefusingDialer),
            StateStore::new(Arc::new(MemoryStorage::new())),
            Arc::new(crate::notify::LogNotifier),
        );
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_counters_json_shape() {
        let counters = Counters {
            enabled: true,
            total_helped: 2,
            alltime_uptime_secs: 10,
            nat_type: NatType::Restricted,
            active_sessions: 1,
            status: ProxyStatus::BrokerUnavailable,
            bytes_relayed: 0,
        };
        let json = serde_json::to_value(&counters).unwrap();
        assert_eq!(json["status"], "broker_unavailable");
        assert_eq!(json["nat_type"], "restricted");
    }
}
