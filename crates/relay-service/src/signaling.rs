//! Signaling wire protocol.
//!
//! Frames are JSON text messages tagged by an `"event"` field:
//!
//! ```text
//! -> {"event":"start","broadcastId":"room1","sdpOffer":"v=0..."}
//! -> {"event":"join","broadcastId":"room1"}
//! <- {"event":"offer","sdpOffer":"v=0..."}
//! -> {"event":"answer","broadcastId":"room1","sdpAnswer":"v=0..."}
//! -> {"event":"iceCandidate","broadcastId":"room1","candidate":{"candidate":"..."}}
//! <- {"event":"broadcastEnded","broadcastId":"room1"}
//! ```
//!
//! Session descriptions and candidates are opaque: the relay never looks
//! inside them.

use crate::errors::RelayError;
use common::types::BroadcastId;
use serde::{Deserialize, Serialize};

/// A connectivity candidate in `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set.
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Inbound events (client -> relay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
    /// Start broadcasting under `broadcast_id`.
    #[serde(rename = "start", rename_all = "camelCase")]
    Start {
        broadcast_id: BroadcastId,
        sdp_offer: String,
    },

    /// Subscribe to a broadcast. The offer is only used when the relay owns
    /// a media pipeline.
    #[serde(rename = "join", rename_all = "camelCase")]
    Join {
        broadcast_id: BroadcastId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_offer: Option<String>,
    },

    /// Viewer's answer to the broadcaster's stored offer.
    #[serde(rename = "answer", rename_all = "camelCase")]
    Answer {
        broadcast_id: BroadcastId,
        sdp_answer: String,
    },

    /// Connectivity candidate for the other party.
    #[serde(rename = "iceCandidate", rename_all = "camelCase")]
    IceCandidate {
        broadcast_id: BroadcastId,
        candidate: IceCandidate,
    },

    /// Explicit stop (broadcaster) or leave (viewer).
    #[serde(rename = "disconnect_request", rename_all = "camelCase")]
    DisconnectRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        broadcast_id: Option<BroadcastId>,
    },
}

impl ClientEvent {
    /// Decode a text frame.
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::InvalidMessage(format!("{e}")))
    }

    /// Bounded event name for logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::Start { .. } => "start",
            ClientEvent::Join { .. } => "join",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice_candidate",
            ClientEvent::DisconnectRequest { .. } => "disconnect_request",
        }
    }
}

/// Outbound events (relay -> client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    /// Media pipeline answer to the broadcaster's offer.
    #[serde(rename = "startResponse", rename_all = "camelCase")]
    StartResponse { sdp_answer: String },

    /// Stored broadcaster offer delivered to a joining viewer.
    #[serde(rename = "offer", rename_all = "camelCase")]
    Offer { sdp_offer: String },

    /// Media pipeline answer to a viewer's offer.
    #[serde(rename = "joinResponse", rename_all = "camelCase")]
    JoinResponse { sdp_answer: String },

    /// Viewer answer relayed to the broadcaster.
    #[serde(rename = "answer", rename_all = "camelCase")]
    Answer { sdp_answer: String },

    /// Connectivity candidate from the other party or the media pipeline.
    #[serde(rename = "iceCandidate", rename_all = "camelCase")]
    IceCandidate { candidate: IceCandidate },

    /// Failed request.
    #[serde(rename = "error", rename_all = "camelCase")]
    Error { message: String, code: i32 },

    /// The broadcast this connection was watching is gone.
    #[serde(rename = "broadcastEnded", rename_all = "camelCase")]
    BroadcastEnded { broadcast_id: BroadcastId },

    /// Acknowledges an explicit stop or leave.
    #[serde(rename = "stopResponse", rename_all = "camelCase")]
    StopResponse { message: String },
}

impl ServerEvent {
    /// Build the `error` event for a failed request.
    #[must_use]
    pub fn from_error(err: &RelayError) -> Self {
        ServerEvent::Error {
            message: err.client_message(),
            code: err.error_code(),
        }
    }

    /// Whether this is peer traffic forwarded on behalf of another client.
    ///
    /// Everything else (responses, errors, `broadcastEnded`) is a lifecycle
    /// event the client must see.
    #[must_use]
    pub const fn is_relayed(&self) -> bool {
        matches!(
            self,
            ServerEvent::Offer { .. } | ServerEvent::Answer { .. } | ServerEvent::IceCandidate { .. }
        )
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Internal(format!("encode failed: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_start() {
        let event =
            ClientEvent::from_json(r#"{"event":"start","broadcastId":"room1","sdpOffer":"v=0"}"#)
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::Start {
                broadcast_id: BroadcastId::new("room1"),
                sdp_offer: "v=0".to_string(),
            }
        );
        assert_eq!(event.name(), "start");
    }

    #[test]
    fn test_decode_join_without_offer() {
        let event = ClientEvent::from_json(r#"{"event":"join","broadcastId":"room1"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::Join {
                broadcast_id: BroadcastId::new("room1"),
                sdp_offer: None,
            }
        );
    }

    #[test]
    fn test_decode_ice_candidate() {
        let event = ClientEvent::from_json(
            r#"{"event":"iceCandidate","broadcastId":"room1",
                "candidate":{"candidate":"candidate:1 1 UDP 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();

        let ClientEvent::IceCandidate { candidate, .. } = event else {
            panic!("expected iceCandidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_decode_disconnect_request_without_broadcast() {
        let event = ClientEvent::from_json(r#"{"event":"disconnect_request"}"#).unwrap();
        assert_eq!(event, ClientEvent::DisconnectRequest { broadcast_id: None });
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        let result = ClientEvent::from_json(r#"{"event":"teleport","broadcastId":"room1"}"#);
        assert!(matches!(result, Err(RelayError::InvalidMessage(_))));

        let result = ClientEvent::from_json("not json");
        assert!(matches!(result, Err(RelayError::InvalidMessage(_))));
    }

    #[test]
    fn test_encode_server_events() {
        let json = ServerEvent::BroadcastEnded {
            broadcast_id: BroadcastId::new("room1"),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"event":"broadcastEnded","broadcastId":"room1"}"#);

        let json = ServerEvent::Offer {
            sdp_offer: "v=0".to_string(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"event":"offer","sdpOffer":"v=0"}"#);
    }

    #[test]
    fn test_error_event_uses_client_message() {
        let event = ServerEvent::from_error(&RelayError::NotFound("room9".to_string()));
        assert_eq!(
            event,
            ServerEvent::Error {
                message: "Broadcast not found".to_string(),
                code: 4,
            }
        );
    }

    #[test]
    fn test_relayed_events_are_peer_traffic_only() {
        assert!(ServerEvent::IceCandidate {
            candidate: IceCandidate::new("candidate:1")
        }
        .is_relayed());
        assert!(ServerEvent::Answer {
            sdp_answer: "v=0".to_string()
        }
        .is_relayed());
        assert!(!ServerEvent::BroadcastEnded {
            broadcast_id: BroadcastId::new("room1")
        }
        .is_relayed());
        assert!(!ServerEvent::StopResponse {
            message: "Left broadcast".to_string()
        }
        .is_relayed());
        assert!(!ServerEvent::from_error(&RelayError::Draining).is_relayed());
    }
}
