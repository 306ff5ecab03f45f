// Shared fakes for the integration tests
//
// FakeNegotiator: scripted peer sessions. The NAT probe (SessionId::PROBE)
// replays `probe_script` when its local description is applied; every other
// session replays `session_script`.
// FakeDialer: in-memory broker channels with scripted dial failures.
// RecordingNotifier: keeps every notification.

#![allow(dead_code)]

use async_trait::async_trait;
use flurry_core::broker::{BrokerSink, BrokerStream};
use flurry_core::{
    BrokerDialer, BrokerError, Candidate, EventSink, NegotiationError, NegotiationHandle,
    Negotiator, Notifier, ProxyConfig, ProxyController, SessionDescription, SessionEvent,
    SessionId, StateStore,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};

// ============================================================================
// NEGOTIATOR
// ============================================================================

#[derive(Default)]
pub struct NegotiatorState {
    pub probe_script: Vec<SessionEvent>,
    pub session_script: Vec<SessionEvent>,
    /// Sinks of real sessions, in creation order
    pub sinks: Vec<EventSink>,
    pub remote_descriptions: Vec<(SessionId, SessionDescription)>,
    pub remote_candidates: Vec<(SessionId, Candidate)>,
    pub created: usize,
    pub closed: usize,
    pub fail_create: bool,
    /// Sessions never finish creating their offer
    pub hang_offer: bool,
}

#[derive(Clone, Default)]
pub struct FakeNegotiator {
    pub state: Arc<Mutex<NegotiatorState>>,
}

impl FakeNegotiator {
    /// Probe sees a server-reflexive candidate; sessions gather one host
    /// candidate and complete.
    pub fn restricted() -> Self {
        Self::with_scripts(
            vec![candidate("srflx")],
            vec![candidate("host"), SessionEvent::GatheringComplete],
        )
    }

    pub fn with_scripts(probe: Vec<SessionEvent>, session: Vec<SessionEvent>) -> Self {
        let negotiator = Self::default();
        {
            let mut state = negotiator.state.lock();
            state.probe_script = probe;
            state.session_script = session;
        }
        negotiator
    }

    pub fn sink(&self, index: usize) -> EventSink {
        self.state.lock().sinks[index].clone()
    }

    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }
}

pub fn candidate(kind: &str) -> SessionEvent {
    SessionEvent::IceCandidate(Candidate::new(format!(
        "candidate:1 1 udp 2122260223 192.0.2.10 50000 typ {}",
        kind
    )))
}

struct FakeHandle {
    sink: EventSink,
    script: Vec<SessionEvent>,
    state: Arc<Mutex<NegotiatorState>>,
    closed: bool,
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn create_session(
        &self,
        events: EventSink,
    ) -> Result<Box<dyn NegotiationHandle>, NegotiationError> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(NegotiationError::CreateFailed("scripted".to_string()));
        }
        let script = if events.id() == SessionId::PROBE {
            state.probe_script.clone()
        } else {
            state.created += 1;
            state.sinks.push(events.clone());
            state.session_script.clone()
        };
        Ok(Box::new(FakeHandle {
            sink: events,
            script,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

#[async_trait]
impl NegotiationHandle for FakeHandle {
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let hang = self.state.lock().hang_offer && self.sink.id() != SessionId::PROBE;
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(SessionDescription::offer(format!("v=0 {}", self.sink.id())))
    }

    async fn set_local_description(
        &mut self,
        _description: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        for event in self.script.drain(..) {
            self.sink.emit(event);
        }
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        if description.sdp.contains("reject") {
            return Err(NegotiationError::DescriptionRejected("scripted".to_string()));
        }
        self.state
            .lock()
            .remote_descriptions
            .push((self.sink.id(), description.clone()));
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &Candidate) -> Result<(), NegotiationError> {
        self.state
            .lock()
            .remote_candidates
            .push((self.sink.id(), candidate.clone()));
        Ok(())
    }

    fn close(&mut self) {
        if self.closed || self.sink.id() == SessionId::PROBE {
            return;
        }
        self.closed = true;
        self.state.lock().closed += 1;
    }
}

// ============================================================================
// BROKER
// ============================================================================

/// The broker's end of one dialed connection
pub struct BrokerPeer {
    pub to_proxy: mpsc::UnboundedSender<String>,
    pub from_proxy: mpsc::UnboundedReceiver<String>,
}

impl BrokerPeer {
    /// Next frame the proxy sent, parsed as JSON
    pub async fn next_json(&mut self) -> serde_json::Value {
        let text = timeout(Duration::from_secs(1), self.from_proxy.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("proxy closed the channel");
        serde_json::from_str(&text).expect("proxy sent invalid JSON")
    }

    pub fn send(&self, text: impl Into<String>) {
        self.to_proxy.send(text.into()).expect("proxy reader gone");
    }

    pub fn answer(&self, id: Option<&str>, sdp: &str) {
        let mut answer = serde_json::json!({
            "type": "answer",
            "answer": {"type": "answer", "sdp": sdp},
            "candidates": [{"candidate": "candidate:7 1 udp 1 198.51.100.4 3478 typ srflx", "sdpMid": "0"}],
        });
        if let Some(id) = id {
            answer["id"] = serde_json::Value::String(id.to_string());
        }
        self.send(answer.to_string());
    }
}

#[derive(Default)]
pub struct DialerState {
    pub failures: VecDeque<BrokerError>,
    pub peers: VecDeque<BrokerPeer>,
    pub dials: usize,
}

#[derive(Clone, Default)]
pub struct FakeDialer {
    pub state: Arc<Mutex<DialerState>>,
}

impl FakeDialer {
    pub fn failing(times: usize) -> Self {
        let dialer = Self::default();
        dialer.fail_next(times);
        dialer
    }

    pub fn fail_next(&self, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state
                .failures
                .push_back(BrokerError::ConnectFailed("connection refused".to_string()));
        }
    }

    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    pub fn take_peer(&self) -> BrokerPeer {
        self.state
            .lock()
            .peers
            .pop_front()
            .expect("no broker connection was dialed")
    }
}

struct FakeSink(mpsc::UnboundedSender<String>);
struct FakeStream(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl BrokerSink for FakeSink {
    async fn send_text(&mut self, text: String) -> Result<(), BrokerError> {
        self.0.send(text).map_err(|e| BrokerError::Send(e.to_string()))
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl BrokerStream for FakeStream {
    async fn next_text(&mut self) -> Option<Result<String, BrokerError>> {
        self.0.recv().await.map(Ok)
    }
}

#[async_trait]
impl BrokerDialer for FakeDialer {
    async fn dial(
        &self,
        _endpoint: &str,
    ) -> Result<(Box<dyn BrokerSink>, Box<dyn BrokerStream>), BrokerError> {
        let mut state = self.state.lock();
        state.dials += 1;
        if let Some(e) = state.failures.pop_front() {
            return Err(e);
        }
        let (to_broker_tx, to_broker_rx) = mpsc::unbounded_channel();
        let (to_proxy_tx, to_proxy_rx) = mpsc::unbounded_channel();
        state.peers.push_back(BrokerPeer {
            to_proxy: to_proxy_tx,
            from_proxy: to_broker_rx,
        });
        Ok((
            Box::new(FakeSink(to_broker_tx)),
            Box::new(FakeStream(to_proxy_rx)),
        ))
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    pub fn count(&self, title: &str) -> usize {
        self.seen.lock().iter().filter(|(t, _)| t == title).count()
    }

    pub fn bodies(&self, title: &str) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter(|(t, _)| t == title)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) -> Result<(), String> {
        self.seen.lock().push((title.to_string(), body.to_string()));
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub proxy: ProxyController,
    pub negotiator: FakeNegotiator,
    pub dialer: FakeDialer,
    pub notifier: RecordingNotifier,
}

impl Harness {
    pub fn new(config: ProxyConfig, negotiator: FakeNegotiator, dialer: FakeDialer) -> Self {
        Self::with_store(
            config,
            negotiator,
            dialer,
            StateStore::new(Arc::new(flurry_core::MemoryStorage::new())),
        )
    }

    pub fn with_store(
        config: ProxyConfig,
        negotiator: FakeNegotiator,
        dialer: FakeDialer,
        store: StateStore,
    ) -> Self {
        let notifier = RecordingNotifier::default();
        let proxy = ProxyController::new(
            config,
            Arc::new(negotiator.clone()),
            Arc::new(dialer.clone()),
            store,
            Arc::new(notifier.clone()),
        )
        .expect("valid config");
        Self {
            proxy,
            negotiator,
            dialer,
            notifier,
        }
    }

    /// Handle events until `done` holds. Gives up after `limit` of
    /// (paused) time without reaching it.
    pub async fn drive_until<F>(&mut self, limit: Duration, done: F) -> bool
    where
        F: Fn(&ProxyController) -> bool,
    {
        let deadline = Instant::now() + limit;
        while !done(&self.proxy) {
            match timeout_at(deadline, self.proxy.step()).await {
                Ok(true) => {}
                _ => return false,
            }
        }
        true
    }

    /// Handle every event that arrives within `duration`
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while let Ok(true) = timeout_at(deadline, self.proxy.step()).await {}
    }
}

pub fn config(max_num_clients: usize) -> ProxyConfig {
    ProxyConfig {
        broker_url: "ws://broker.test/".to_string(),
        max_num_clients,
        ..Default::default()
    }
}
