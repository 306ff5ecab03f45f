//! Broker signaling protocol: JSON messages on the duplex channel

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::nat::NatType;
use crate::negotiation::{Candidate, SessionDescription};

/// Broker protocol errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed broker message: {0}")]
    Malformed(String),
    #[error("Broker message has no type discriminator")]
    MissingType,
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A signaling message, discriminated by its `type` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BrokerMessage {
    /// Outbound: our local description plus every gathered candidate
    Offer {
        /// Session the offer belongs to, echoed back by id-aware brokers
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        offer: SessionDescription,
        nat: NatType,
        candidates: Vec<Candidate>,
    },
    /// Inbound: the client's description and its candidates
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        answer: SessionDescription,
        #[serde(default)]
        candidates: Vec<Candidate>,
    },
}

impl BrokerMessage {
    /// Serialize to the JSON text frame sent on the wire
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse an inbound text frame.
    ///
    /// Returns `Ok(None)` for well-formed documents whose `type` this side
    /// does not handle; only `answer` is accepted inbound.
    pub fn parse_inbound(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        if kind != "answer" {
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Human-readable message type
    pub fn message_type(&self) -> &'static str {
        match self {
            BrokerMessage::Offer { .. } => "offer",
            BrokerMessage::Answer { .. } => "answer",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_shape() {
        let msg = BrokerMessage::Offer {
            id: Some("17".to_string()),
            offer: SessionDescription::offer("v=0"),
            nat: NatType::Restricted,
            candidates: vec![Candidate::new("candidate:1 1 udp 1 10.0.0.2 9 typ host")],
        };

        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["id"], "17");
        assert_eq!(value["offer"]["type"], "offer");
        assert_eq!(value["offer"]["sdp"], "v=0");
        assert_eq!(value["nat"], "restricted");
        assert_eq!(value["candidates"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_answer_with_candidates() {
        let text = r#"{
            "type": "answer",
            "answer": {"type": "answer", "sdp": "v=0 remote"},
            "candidates": [{"candidate": "candidate:1 1 udp 1 1.2.3.4 5 typ srflx", "sdpMid": "0"}]
        }"#;

        match BrokerMessage::parse_inbound(text).unwrap() {
            Some(BrokerMessage::Answer { id, answer, candidates }) => {
                assert!(id.is_none());
                assert_eq!(answer.sdp, "v=0 remote");
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_answer_without_candidates() {
        let text = r#"{"type":"answer","id":"99","answer":{"type":"answer","sdp":"x"}}"#;
        match BrokerMessage::parse_inbound(text).unwrap() {
            Some(BrokerMessage::Answer { id, candidates, .. }) => {
                assert_eq!(id.as_deref(), Some("99"));
                assert!(candidates.is_empty());
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_type_is_ignored() {
        assert_eq!(
            BrokerMessage::parse_inbound(r#"{"type":"poll-again","interval":30}"#).unwrap(),
            None
        );
        // An offer never travels broker -> proxy.
        assert_eq!(
            BrokerMessage::parse_inbound(
                r#"{"type":"offer","offer":{"type":"offer","sdp":""},"nat":"unknown","candidates":[]}"#
            )
            .unwrap(),
            None
        );
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            BrokerMessage::parse_inbound("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            BrokerMessage::parse_inbound(r#"{"answer":{}}"#),
            Err(ProtocolError::MissingType)
        );
        assert!(matches!(
            BrokerMessage::parse_inbound(r#"{"type":"answer"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
