// NAT classification
//
// Best-effort categorization of local reachability, sent to the broker as a
// hint with every offer. It is never a correctness requirement: anything
// that goes wrong degrades to `NatType::Unknown`.
//
// The probe is a throwaway peer session. We apply a local offer to kick off
// candidate gathering and watch which candidate types show up:
// - server-reflexive first       => Restricted
// - relay first                  => Symmetric
// - gathering ends inconclusive  => Unrestricted
// - nothing before the deadline  => Unknown

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::negotiation::{CandidateKind, EventSink, Negotiator, SessionEvent};
use crate::proxy::ProxyEvent;
use crate::session::SessionId;

// ============================================================================
// NAT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    #[default]
    Unknown,
    Unrestricted,
    Restricted,
    Symmetric,
}

impl NatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::Unknown => "unknown",
            NatType::Unrestricted => "unrestricted",
            NatType::Restricted => "restricted",
            NatType::Symmetric => "symmetric",
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unrecognized NAT type: {0}")]
pub struct ParseNatTypeError(String);

impl FromStr for NatType {
    type Err = ParseNatTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(NatType::Unknown),
            "unrestricted" => Ok(NatType::Unrestricted),
            "restricted" => Ok(NatType::Restricted),
            "symmetric" => Ok(NatType::Symmetric),
            _ => Err(ParseNatTypeError(s.to_string())),
        }
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum NatError {
    #[error("Probe setup failed: {0}")]
    ProbeSetup(String),
    #[error("Probe timed out")]
    Timeout,
    #[error("Probe event stream ended")]
    StreamEnded,
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// Observation state fed candidate events in arrival order
#[derive(Debug, Default)]
struct Observation {
    verdict: Option<NatType>,
}

impl Observation {
    /// First conclusive event wins; later events are ignored.
    fn observe(&mut self, event: &SessionEvent) -> Option<NatType> {
        if self.verdict.is_some() {
            return self.verdict;
        }
        self.verdict = match event {
            SessionEvent::IceCandidate(candidate) => match candidate.kind() {
                CandidateKind::ServerReflexive => Some(NatType::Restricted),
                CandidateKind::Relay => Some(NatType::Symmetric),
                _ => None,
            },
            SessionEvent::GatheringComplete => Some(NatType::Unrestricted),
            _ => None,
        };
        self.verdict
    }
}

/// One-shot NAT classifier
pub struct NatClassifier {
    negotiator: Arc<dyn Negotiator>,
}

impl NatClassifier {
    pub fn new(negotiator: Arc<dyn Negotiator>) -> Self {
        Self { negotiator }
    }

    /// Classify local reachability. Never fails: errors map to `Unknown`.
    pub async fn classify(&self, timeout: Duration) -> NatType {
        debug!("Detecting NAT type (timeout {:?})", timeout);
        match self.probe(timeout).await {
            Ok(nat_type) => {
                info!("NAT type: {}", nat_type);
                nat_type
            }
            Err(NatError::Timeout) => {
                info!("NAT probe timed out after {:?}", timeout);
                NatType::Unknown
            }
            Err(e) => {
                warn!("NAT detection failed: {}", e);
                NatType::Unknown
            }
        }
    }

    async fn probe(&self, timeout: Duration) -> Result<NatType, NatError> {
        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = mpsc::unbounded_channel::<ProxyEvent>();
        let sink = EventSink::new(SessionId::PROBE, tx);

        let mut handle = timeout_at(deadline, self.negotiator.create_session(sink))
            .await
            .map_err(|_| NatError::Timeout)?
            .map_err(|e| NatError::ProbeSetup(e.to_string()))?;

        let result: Result<NatType, NatError> = async {
            let offer = timeout_at(deadline, handle.create_offer())
                .await
                .map_err(|_| NatError::Timeout)?
                .map_err(|e| NatError::ProbeSetup(e.to_string()))?;
            timeout_at(deadline, handle.set_local_description(&offer))
                .await
                .map_err(|_| NatError::Timeout)?
                .map_err(|e| NatError::ProbeSetup(e.to_string()))?;

            let mut observation = Observation::default();
            loop {
                match timeout_at(deadline, rx.recv()).await {
                    Err(_) => return Err(NatError::Timeout),
                    Ok(None) => return Err(NatError::StreamEnded),
                    Ok(Some(ProxyEvent::Session { event, .. })) => {
                        if let Some(nat_type) = observation.observe(&event) {
                            return Ok(nat_type);
                        }
                    }
                    Ok(Some(_)) => continue,
                }
            }
        }
        .await;

        handle.close();
        result
    }
}
