//! Relay session state machine
//!
//! One negotiated peer transport slot relaying one client's traffic.
//!
//! ```text
//! Offering ─► AwaitingAnswer ─► Negotiating ─► Active
//!    │              │                │            │
//!    └──────────────┴───── Closing ◄─┴────────────┘
//!                              │
//!                              ▼
//!                           Closed        (any non-terminal) ─► Failed
//! ```
//!
//! Transitions only move forward. `Closed` and `Failed` are absorbing.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::broker::BrokerMessage;
use crate::nat::NatType;
use crate::negotiation::{Candidate, NegotiationError, NegotiationHandle, SessionDescription};

// ============================================================================
// SESSION ID
// ============================================================================

/// Opaque session token derived from the monotonic clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Reserved for the NAT probe, never handed to a real session
    pub const PROBE: SessionId = SessionId(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Derive a fresh id from monotonic time (microseconds since the first
    /// call in this process), never below a previously derived id. On
    /// collision, bump until unused. Ids are therefore strictly increasing
    /// in creation order.
    pub fn derive(taken: impl Fn(&SessionId) -> bool) -> Self {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        static LAST: AtomicU64 = AtomicU64::new(0);

        let epoch = *EPOCH.get_or_init(Instant::now);
        let micros = epoch.elapsed().as_micros() as u64;

        let mut candidate = micros.max(LAST.load(Ordering::Relaxed) + 1);
        while taken(&SessionId(candidate)) {
            candidate += 1;
        }
        LAST.fetch_max(candidate, Ordering::Relaxed);
        SessionId(candidate)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(SessionId)
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Local offer applied, gathering candidates
    Offering,
    /// Offer sent to the broker
    AwaitingAnswer,
    /// Remote description applied, waiting for the channel
    Negotiating,
    /// Data channel open, relaying
    Active,
    /// Tearing down
    Closing,
    /// Torn down, entry removed
    Closed,
    /// Gave up on this slot
    Failed,
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Offering => 0,
            SessionState::AwaitingAnswer => 1,
            SessionState::Negotiating => 2,
            SessionState::Active => 3,
            SessionState::Closing => 4,
            SessionState::Closed | SessionState::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() || next.rank() <= self.rank() {
            return false;
        }
        match (self, next) {
            (Offering, AwaitingAnswer) => true,
            (AwaitingAnswer, Negotiating) => true,
            (Negotiating, Active) => true,
            (_, Closing) => true,
            (Closing, Closed) => true,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("Offer already finalized, candidate rejected")]
    OfferFrozen,
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("No answer within the datachannel timeout")]
    Timeout,
}

// ============================================================================
// SESSION
// ============================================================================

pub struct Session {
    id: SessionId,
    state: SessionState,
    nat_hint: NatType,
    local_description: SessionDescription,
    candidates: Vec<Candidate>,
    frozen_offer: Option<BrokerMessage>,
    handle: Option<Box<dyn NegotiationHandle>>,
    created_at: Instant,
    bytes_relayed: u64,
    /// Bumped whenever the offer goes out; answer timeouts carry it
    offer_epoch: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("nat_hint", &self.nat_hint)
            .field("candidates", &self.candidates.len())
            .field("bytes_relayed", &self.bytes_relayed)
            .finish()
    }
}

impl Session {
    /// Wrap a handle whose local description has already been applied
    pub fn new(
        id: SessionId,
        handle: Box<dyn NegotiationHandle>,
        local_description: SessionDescription,
        nat_hint: NatType,
    ) -> Self {
        Self {
            id,
            state: SessionState::Offering,
            nat_hint,
            local_description,
            candidates: Vec::new(),
            frozen_offer: None,
            handle: Some(handle),
            created_at: Instant::now(),
            bytes_relayed: 0,
            offer_epoch: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn nat_hint(&self) -> NatType {
        self.nat_hint
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed
    }

    pub fn offer_epoch(&self) -> u32 {
        self.offer_epoch
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, or refuse and leave the state untouched
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Session {} {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Append a gathered candidate; rejected once the offer is out
    pub fn add_candidate(&mut self, candidate: Candidate) -> Result<(), SessionError> {
        if self.frozen_offer.is_some() || self.state != SessionState::Offering {
            return Err(SessionError::OfferFrozen);
        }
        trace!("Session {} gathered {}", self.id, candidate.candidate);
        self.candidates.push(candidate);
        Ok(())
    }

    /// Freeze candidates, build the offer and move to `AwaitingAnswer`
    pub fn finalize_offer(&mut self) -> Result<BrokerMessage, SessionError> {
        self.transition(SessionState::AwaitingAnswer)?;
        let offer = BrokerMessage::Offer {
            id: Some(self.id.to_string()),
            offer: self.local_description.clone(),
            nat: self.nat_hint,
            candidates: self.candidates.clone(),
        };
        self.frozen_offer = Some(offer.clone());
        self.offer_epoch = self.offer_epoch.wrapping_add(1);
        Ok(offer)
    }

    /// The frozen offer, for re-sending after a broker reconnect
    pub fn pending_offer(&mut self) -> Option<BrokerMessage> {
        if self.state != SessionState::AwaitingAnswer {
            return None;
        }
        let offer = self.frozen_offer.clone()?;
        self.offer_epoch = self.offer_epoch.wrapping_add(1);
        Some(offer)
    }

    /// Feed the client's answer to the primitive and move to `Negotiating`
    pub async fn apply_answer(
        &mut self,
        answer: &SessionDescription,
        candidates: &[Candidate],
    ) -> Result<(), SessionError> {
        if self.state != SessionState::AwaitingAnswer {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: SessionState::Negotiating,
            });
        }
        let handle = self.handle.as_mut().ok_or_else(|| {
            NegotiationError::DescriptionRejected("handle released".to_string())
        })?;

        handle.set_remote_description(answer).await?;
        for candidate in candidates {
            handle.add_candidate(candidate).await?;
        }
        self.transition(SessionState::Negotiating)
    }

    /// Data channel opened. Returns true when this is the session's first
    /// activation, which is the only moment a client counts as helped.
    pub fn on_channel_open(&mut self) -> bool {
        match self.transition(SessionState::Active) {
            Ok(()) => true,
            Err(e) => {
                debug!("Session {}: ignoring channel open ({})", self.id, e);
                false
            }
        }
    }

    /// Count relayed bytes. Only active sessions relay.
    pub fn record_bytes(&mut self, len: usize) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        self.bytes_relayed = self.bytes_relayed.saturating_add(len as u64);
        trace!("Session {} relaying {} bytes", self.id, len);
        true
    }

    /// `Closing -> Closed`, releasing the handle on the way
    pub fn close(&mut self) {
        if self.is_terminal() {
            return;
        }
        if self.state != SessionState::Closing {
            let _ = self.transition(SessionState::Closing);
        }
        self.release();
        let _ = self.transition(SessionState::Closed);
    }

    /// Terminal failure; also releases the handle
    pub fn fail(&mut self, reason: &SessionError) {
        if self.is_terminal() {
            return;
        }
        warn!("Session {} failed in {}: {}", self.id, self.state, reason);
        let _ = self.transition(SessionState::Failed);
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// TESTS
// ============================================================================
