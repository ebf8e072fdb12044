//! Relay error types.
//!
//! Every error is recoverable at the per-event level: the dispatcher turns it
//! into a single `error` event for the originating connection and leaves the
//! registry as it was before the failed operation. Internal details are
//! logged server-side but not exposed to clients.

use crate::media::MediaError;
use thiserror::Error;

/// Relay error type.
///
/// Maps to the numeric `code` carried in outbound `error` events:
/// - `InvalidMessage`: `BAD_REQUEST` (1)
/// - `NotFound`: `NOT_FOUND` (4)
/// - `AlreadyExists`, `AlreadyMember`: `CONFLICT` (5)
/// - `Internal`: `INTERNAL_ERROR` (6)
/// - `CapacityExceeded`, `Draining`: `CAPACITY_EXCEEDED` (7)
/// - `NegotiationFailed`, `ConnectionFailed`: `NEGOTIATION_FAILED` (8)
#[derive(Debug, Error)]
pub enum RelayError {
    /// No broadcast with the given ID.
    #[error("Broadcast not found: {0}")]
    NotFound(String),

    /// A broadcast with this ID is already running.
    #[error("Broadcast already exists: {0}")]
    AlreadyExists(String),

    /// The connection is already a member of a broadcast.
    #[error("Connection is already a member of broadcast {0}")]
    AlreadyMember(String),

    /// Offer/answer/candidate exchange with the media collaborator failed.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Interconnecting media endpoints failed.
    #[error("Endpoint connection failed: {0}")]
    ConnectionFailed(String),

    /// Broadcast or relay is at capacity.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Relay is shutting down.
    #[error("Relay is draining")]
    Draining,

    /// Inbound frame could not be decoded.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns the client-facing error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            RelayError::InvalidMessage(_) => 1,                               // BAD_REQUEST
            RelayError::NotFound(_) => 4,                                     // NOT_FOUND
            RelayError::AlreadyExists(_) | RelayError::AlreadyMember(_) => 5, // CONFLICT
            RelayError::Internal(_) => 6,                                     // INTERNAL_ERROR
            RelayError::CapacityExceeded(_) | RelayError::Draining => 7,      // CAPACITY_EXCEEDED
            RelayError::NegotiationFailed(_) | RelayError::ConnectionFailed(_) => 8, // NEGOTIATION_FAILED
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            RelayError::NotFound(_) => "Broadcast not found".to_string(),
            RelayError::AlreadyExists(_) => "Broadcast already exists".to_string(),
            RelayError::AlreadyMember(_) => "Already a member of a broadcast".to_string(),
            RelayError::NegotiationFailed(_) => "Error processing offer".to_string(),
            RelayError::ConnectionFailed(_) => "Error connecting media endpoints".to_string(),
            RelayError::CapacityExceeded(msg) | RelayError::InvalidMessage(msg) => msg.clone(),
            RelayError::Draining => "Relay is shutting down, please reconnect".to_string(),
            RelayError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Short, bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            RelayError::NotFound(_) => "not_found",
            RelayError::AlreadyExists(_) => "already_exists",
            RelayError::AlreadyMember(_) => "already_member",
            RelayError::NegotiationFailed(_) => "negotiation_failed",
            RelayError::ConnectionFailed(_) => "connection_failed",
            RelayError::CapacityExceeded(_) => "capacity_exceeded",
            RelayError::Draining => "draining",
            RelayError::InvalidMessage(_) => "invalid_message",
            RelayError::Internal(_) => "internal",
        }
    }
}

impl From<MediaError> for RelayError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Connect(msg) => RelayError::ConnectionFailed(msg),
            other => RelayError::NegotiationFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(RelayError::InvalidMessage("bad".to_string()).error_code(), 1);
        assert_eq!(RelayError::NotFound("room1".to_string()).error_code(), 4);
        assert_eq!(RelayError::AlreadyExists("room1".to_string()).error_code(), 5);
        assert_eq!(RelayError::AlreadyMember("room1".to_string()).error_code(), 5);
        assert_eq!(RelayError::Internal("closed".to_string()).error_code(), 6);
        assert_eq!(
            RelayError::CapacityExceeded("max".to_string()).error_code(),
            7
        );
        assert_eq!(RelayError::Draining.error_code(), 7);
        assert_eq!(
            RelayError::NegotiationFailed("sdp".to_string()).error_code(),
            8
        );
        assert_eq!(
            RelayError::ConnectionFailed("link".to_string()).error_code(),
            8
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = RelayError::Internal("channel send failed: receiver dropped".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = RelayError::NegotiationFailed("pipeline 7f3a: sdp parse error".to_string());
        assert!(!err.client_message().contains("7f3a"));

        let err = RelayError::NotFound("secret-room".to_string());
        assert_eq!(err.client_message(), "Broadcast not found");
    }

    #[test]
    fn test_media_error_conversion() {
        let err: RelayError = MediaError::Connect("refused".to_string()).into();
        assert!(matches!(err, RelayError::ConnectionFailed(_)));

        let err: RelayError = MediaError::ProcessOffer("bad sdp".to_string()).into();
        assert!(matches!(err, RelayError::NegotiationFailed(_)));

        let err: RelayError = MediaError::Timeout("create_pipeline").into();
        assert!(matches!(err, RelayError::NegotiationFailed(_)));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", RelayError::NotFound("room1".to_string())),
            "Broadcast not found: room1"
        );
        assert_eq!(format!("{}", RelayError::Draining), "Relay is draining");
    }
}
