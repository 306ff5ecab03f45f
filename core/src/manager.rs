//! Session Manager: admission cap, event routing, teardown
//!
//! Sessions live in a map ordered by id. Ids grow with creation time, so the
//! first entry is always the oldest session. The map never holds more than
//! `max_num_clients` entries; terminal sessions are removed immediately.
//!
//! Every call into the negotiation primitive is bounded by the step timeout,
//! so a wedged primitive fails one session instead of the event loop.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::BrokerMessage;
use crate::nat::NatType;
use crate::negotiation::{
    Candidate, EventSink, NegotiationError, Negotiator, PeerConnectionState,
    SessionDescription, SessionEvent,
};
use crate::proxy::ProxyEvent;
use crate::session::{Session, SessionError, SessionId, SessionState};

/// What handling a session event did, for the controller to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// No such session (late event) or nothing to do
    Ignored,
    /// Session state changed without side effects outside the manager
    Updated,
    /// Candidates are frozen; the offer should go to the broker
    OfferReady { offer: BrokerMessage, epoch: u32 },
    /// First channel open of this session
    Activated,
    /// Session reached a terminal state and was removed
    Terminated,
}

/// Result of routing a broker answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerRoute {
    /// Applied to this session, now negotiating
    Applied(SessionId),
    /// This session rejected the answer and was removed
    Failed(SessionId),
    /// No session is waiting for this answer
    Unmatched,
}

/// A frozen offer due for (re)sending
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub id: SessionId,
    pub offer: BrokerMessage,
    pub epoch: u32,
}

pub struct SessionManager {
    negotiator: Arc<dyn Negotiator>,
    events: mpsc::UnboundedSender<ProxyEvent>,
    max_num_clients: usize,
    step_timeout: Duration,
    sessions: BTreeMap<SessionId, Session>,
    /// Bytes counted since the last reset, including removed sessions
    bytes_relayed: u64,
}

impl SessionManager {
    pub fn new(
        negotiator: Arc<dyn Negotiator>,
        events: mpsc::UnboundedSender<ProxyEvent>,
        max_num_clients: usize,
        step_timeout: Duration,
    ) -> Self {
        Self {
            negotiator,
            events,
            max_num_clients,
            step_timeout,
            sessions: BTreeMap::new(),
            bytes_relayed: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.sessions.len() < self.max_num_clients
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed
    }

    pub fn reset_throughput(&mut self) {
        self.bytes_relayed = 0;
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn state_of(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(Session::state)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Create one session if under the cap. `Ok(None)` when full.
    ///
    /// The new session starts gathering immediately; its offer becomes ready
    /// once `GatheringComplete` comes back through the event queue.
    pub async fn admit(&mut self, nat_hint: NatType) -> Result<Option<SessionId>, SessionError> {
        if !self.has_capacity() {
            debug!(
                "At capacity ({}/{}), not admitting",
                self.sessions.len(),
                self.max_num_clients
            );
            return Ok(None);
        }

        let id = SessionId::derive(|id| self.sessions.contains_key(id));
        let sink = EventSink::new(id, self.events.clone());
        let step_timeout = self.step_timeout;
        let mut handle = bounded(step_timeout, self.negotiator.create_session(sink)).await?;

        let local = match bounded(step_timeout, handle.create_offer()).await {
            Ok(offer) => offer,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };
        if let Err(e) = bounded(step_timeout, handle.set_local_description(&local)).await {
            handle.close();
            return Err(e);
        }

        self.sessions
            .insert(id, Session::new(id, handle, local, nat_hint));
        info!(
            "Admitted session {} ({}/{})",
            id,
            self.sessions.len(),
            self.max_num_clients
        );
        Ok(Some(id))
    }

    /// Admit until the cap is reached. Stops at the first failure.
    pub async fn fill(&mut self, nat_hint: NatType) -> Result<Vec<SessionId>, SessionError> {
        let mut admitted = Vec::new();
        while let Some(id) = self.admit(nat_hint).await? {
            admitted.push(id);
        }
        Ok(admitted)
    }

    /// Apply one event from the negotiation primitive
    pub fn handle_event(&mut self, id: SessionId, event: SessionEvent) -> SessionOutcome {
        let session = match self.sessions.get_mut(&id) {
            Some(session) => session,
            None => {
                debug!("Dropping {:?} for unknown session {}", event, id);
                return SessionOutcome::Ignored;
            }
        };

        match event {
            SessionEvent::IceCandidate(candidate) => match session.add_candidate(candidate) {
                Ok(()) => SessionOutcome::Updated,
                Err(e) => {
                    debug!("Session {}: {}", id, e);
                    SessionOutcome::Ignored
                }
            },
            SessionEvent::GatheringComplete => match session.finalize_offer() {
                Ok(offer) => SessionOutcome::OfferReady {
                    offer,
                    epoch: session.offer_epoch(),
                },
                Err(e) => {
                    debug!("Session {}: {}", id, e);
                    SessionOutcome::Ignored
                }
            },
            SessionEvent::ChannelOpen => {
                if session.on_channel_open() {
                    info!("Session {} active after {:?}", id, session.age());
                    SessionOutcome::Activated
                } else {
                    SessionOutcome::Ignored
                }
            }
            SessionEvent::ChannelMessage(bytes) => {
                if session.record_bytes(bytes.len()) {
                    self.bytes_relayed = self.bytes_relayed.saturating_add(bytes.len() as u64);
                    SessionOutcome::Updated
                } else {
                    SessionOutcome::Ignored
                }
            }
            SessionEvent::ChannelClose => {
                self.close(id);
                SessionOutcome::Terminated
            }
            SessionEvent::ConnectionState(PeerConnectionState::Closed) => {
                self.close(id);
                SessionOutcome::Terminated
            }
            SessionEvent::ConnectionState(PeerConnectionState::Failed) => {
                let reason = SessionError::Negotiation(NegotiationError::CreateFailed(
                    "peer connection failed".to_string(),
                ));
                self.fail(id, &reason);
                SessionOutcome::Terminated
            }
            SessionEvent::ConnectionState(state) => {
                debug!("Session {} connection state {:?}", id, state);
                SessionOutcome::Ignored
            }
        }
    }

    /// Route an answer to its session: by id when it names an awaiting
    /// session, otherwise to the oldest awaiting session if it has no id.
    pub async fn route_answer(
        &mut self,
        answer_id: Option<&str>,
        answer: &SessionDescription,
        candidates: &[Candidate],
    ) -> AnswerRoute {
        let target = match answer_id {
            Some(raw) => raw
                .parse::<SessionId>()
                .ok()
                .filter(|id| self.state_of(*id) == Some(SessionState::AwaitingAnswer)),
            None => self.oldest_awaiting(),
        };

        let id = match target {
            Some(id) => id,
            None => {
                warn!(
                    "No session awaiting answer{}",
                    answer_id.map(|i| format!(" {}", i)).unwrap_or_default()
                );
                return AnswerRoute::Unmatched;
            }
        };

        let step_timeout = self.step_timeout;
        let result = match self.sessions.get_mut(&id) {
            Some(session) => {
                match tokio::time::timeout(step_timeout, session.apply_answer(answer, candidates))
                    .await
                {
                    Ok(applied) => applied,
                    Err(_) => Err(SessionError::Timeout),
                }
            }
            None => return AnswerRoute::Unmatched,
        };

        match result {
            Ok(()) => AnswerRoute::Applied(id),
            Err(e) => {
                self.fail(id, &e);
                AnswerRoute::Failed(id)
            }
        }
    }

    /// Fail a session whose answer never came. Stale epochs are ignored.
    pub fn expire_answer(&mut self, id: SessionId, epoch: u32) -> bool {
        let expired = self
            .sessions
            .get(&id)
            .map(|s| s.state() == SessionState::AwaitingAnswer && s.offer_epoch() == epoch)
            .unwrap_or(false);
        if expired {
            self.fail(id, &SessionError::Timeout);
        }
        expired
    }

    /// Fail an answered session whose data channel never opened
    pub fn expire_negotiation(&mut self, id: SessionId) -> bool {
        let expired = self.state_of(id) == Some(SessionState::Negotiating);
        if expired {
            self.fail(id, &SessionError::Timeout);
        }
        expired
    }

    /// Frozen offers of every session still awaiting an answer, oldest first
    pub fn resend_offers(&mut self) -> Vec<PendingOffer> {
        self.sessions
            .values_mut()
            .filter_map(|session| {
                let offer = session.pending_offer()?;
                Some(PendingOffer {
                    id: session.id(),
                    offer,
                    epoch: session.offer_epoch(),
                })
            })
            .collect()
    }

    /// Remove a session after it terminated. Returns whether it was present.
    pub fn on_session_terminated(&mut self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some(mut session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close every session and clear the map
    pub fn shutdown(&mut self) -> usize {
        let count = self.sessions.len();
        for session in self.sessions.values_mut() {
            session.close();
        }
        self.sessions.clear();
        if count > 0 {
            info!("Closed {} session(s)", count);
        }
        count
    }

    fn oldest_awaiting(&self) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.state() == SessionState::AwaitingAnswer)
            .map(Session::id)
    }

    fn close(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.close();
        }
        self.on_session_terminated(id);
    }

    fn fail(&mut self, id: SessionId, reason: &SessionError) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.fail(reason);
        }
        self.on_session_terminated(id);
    }
}

/// Run one negotiation step under a deadline
async fn bounded<T, F>(limit: Duration, step: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, NegotiationError>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::Timeout),
    }
}
