// Transport negotiation collaborator
//
// The peer-connection primitive (offer/answer, candidate gathering, the
// data channel) lives outside this crate. This module pins down the narrow
// interface the core drives it through, and the typed events it reports
// back. Events never call into the core directly: they are queued on the
// controller's event loop through an `EventSink`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::proxy::ProxyEvent;
use crate::session::SessionId;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Failed to create peer session: {0}")]
    CreateFailed(String),
    #[error("Failed to create offer: {0}")]
    OfferFailed(String),
    #[error("Failed to apply session description: {0}")]
    DescriptionRejected(String),
    #[error("Failed to add candidate: {0}")]
    CandidateRejected(String),
}

// ============================================================================
// WIRE-SHAPED TYPES
// ============================================================================

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Local or remote session description (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate as exchanged with the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Candidate type, from the `typ` token of the candidate line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    /// Parse the candidate type out of the candidate line
    pub fn kind(&self) -> CandidateKind {
        let mut tokens = self.candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return match tokens.next() {
                    Some("host") => CandidateKind::Host,
                    Some("srflx") => CandidateKind::ServerReflexive,
                    Some("prflx") => CandidateKind::PeerReflexive,
                    Some("relay") => CandidateKind::Relay,
                    _ => CandidateKind::Unknown,
                };
            }
        }
        CandidateKind::Unknown
    }
}

/// Peer connection state as reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Everything the primitive can tell us about one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A local candidate was gathered
    IceCandidate(Candidate),
    /// Candidate gathering finished (the "null candidate")
    GatheringComplete,
    ConnectionState(PeerConnectionState),
    ChannelOpen,
    ChannelClose,
    ChannelMessage(Vec<u8>),
}

/// Per-session handle the primitive uses to report events.
///
/// Cheap to clone. Sending after the controller is gone is silently dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: SessionId,
    tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl EventSink {
    pub fn new(id: SessionId, tx: mpsc::UnboundedSender<ProxyEvent>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(ProxyEvent::Session { id: self.id, event });
    }

    pub fn ice_candidate(&self, candidate: Candidate) {
        self.emit(SessionEvent::IceCandidate(candidate));
    }

    pub fn gathering_complete(&self) {
        self.emit(SessionEvent::GatheringComplete);
    }

    pub fn connection_state(&self, state: PeerConnectionState) {
        self.emit(SessionEvent::ConnectionState(state));
    }

    pub fn channel_open(&self) {
        self.emit(SessionEvent::ChannelOpen);
    }

    pub fn channel_close(&self) {
        self.emit(SessionEvent::ChannelClose);
    }

    pub fn channel_message(&self, bytes: Vec<u8>) {
        self.emit(SessionEvent::ChannelMessage(bytes));
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Factory for peer sessions
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Create a fresh peer connection with an unordered, no-retransmit data
    /// channel. All of its events must be reported through `events`.
    async fn create_session(
        &self,
        events: EventSink,
    ) -> Result<Box<dyn NegotiationHandle>, NegotiationError>;
}

/// One live peer connection
#[async_trait]
pub trait NegotiationHandle: Send {
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    /// Applying the local description starts candidate gathering.
    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_candidate(&mut self, candidate: &Candidate) -> Result<(), NegotiationError>;

    /// Release the connection. Must be idempotent and must not fail.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_kind_parsing() {
        let host = Candidate::new("candidate:1 1 udp 2122260223 192.168.1.4 50000 typ host");
        let srflx = Candidate::new(
            "candidate:2 1 udp 1686052607 203.0.113.7 41000 typ srflx raddr 192.168.1.4 rport 50000",
        );
        let relay = Candidate::new("candidate:3 1 udp 41885439 198.51.100.2 3478 typ relay");
        let garbage = Candidate::new("not a candidate");

        assert_eq!(host.kind(), CandidateKind::Host);
        assert_eq!(srflx.kind(), CandidateKind::ServerReflexive);
        assert_eq!(relay.kind(), CandidateKind::Relay);
        assert_eq!(garbage.kind(), CandidateKind::Unknown);
    }

    #[test]
    fn test_candidate_json_shape() {
        let candidate = Candidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 1 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);

        let parsed: Candidate =
            serde_json::from_str(r#"{"candidate":"candidate:9 1 udp 1 1.2.3.4 9 typ relay"}"#)
                .unwrap();
        assert_eq!(parsed.kind(), CandidateKind::Relay);
        assert!(parsed.sdp_mid.is_none());
    }

    #[test]
    fn test_description_json_shape() {
        let desc = SessionDescription::offer("v=0");
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[tokio::test]
    async fn test_event_sink_tags_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(SessionId::from_raw(42), tx);
        sink.channel_open();

        match rx.recv().await {
            Some(ProxyEvent::Session { id, event }) => {
                assert_eq!(id, SessionId::from_raw(42));
                assert_eq!(event, SessionEvent::ChannelOpen);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
