//! Message types for the relay actor.
//!
//! Requests that need an answer carry a `tokio::sync::oneshot` sender.
//! Signaling events do not: their results are delivered to the originating
//! connection's outbound queue.

use crate::errors::RelayError;
use crate::media::negotiation::{BroadcasterNegotiation, ViewerNegotiation};
use crate::media::MediaError;
use crate::signaling::ClientEvent;

use super::connection::ConnectionHandle;

use chrono::{DateTime, Utc};
use common::types::{BroadcastId, ConnectionId};
use tokio::sync::oneshot;

/// Messages sent to `RelayActor`.
#[derive(Debug)]
pub enum RelayMessage {
    /// Register a new signaling connection.
    Connect {
        connection: ConnectionHandle,
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },

    /// Inbound signaling event from a registered connection.
    Event {
        connection_id: ConnectionId,
        event: ClientEvent,
    },

    /// Inbound frame that could not be decoded into an event.
    Malformed {
        connection_id: ConnectionId,
        error: RelayError,
    },

    /// Transport-level disconnect.
    Disconnect { connection_id: ConnectionId },

    /// A connection's outbound queue overflowed outside the actor (candidate
    /// forwarder). The relay evicts it.
    Overflowed { connection_id: ConnectionId },

    /// Broadcaster media negotiation finished (success or failure).
    StartNegotiated {
        broadcast_id: BroadcastId,
        connection_id: ConnectionId,
        attempt: u64,
        result: Result<BroadcasterNegotiation, MediaError>,
    },

    /// Viewer media negotiation finished (success or failure).
    JoinNegotiated {
        broadcast_id: BroadcastId,
        connection_id: ConnectionId,
        attempt: u64,
        result: Result<ViewerNegotiation, MediaError>,
    },

    /// Get relay status (for health checks and tests).
    GetStatus {
        respond_to: oneshot::Sender<RelayStatus>,
    },

    /// Get a snapshot of one broadcast.
    GetBroadcast {
        broadcast_id: BroadcastId,
        respond_to: oneshot::Sender<Result<BroadcastInfo, RelayError>>,
    },

    /// Stop accepting broadcasts, end all running ones and stop the actor.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
}

/// Relay status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    /// Sessions (active or reserved).
    pub broadcast_count: usize,
    /// Confirmed viewers across all sessions.
    pub viewer_count: usize,
    /// Registered signaling connections.
    pub connection_count: usize,
    /// Whether the relay is draining.
    pub is_draining: bool,
    /// Last observed mailbox depth.
    pub mailbox_depth: usize,
}

/// Snapshot of one broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastInfo {
    pub broadcast_id: BroadcastId,
    pub broadcaster: ConnectionId,
    /// Confirmed viewers, sorted.
    pub viewers: Vec<ConnectionId>,
    /// Viewers whose negotiation is in flight.
    pub pending_viewers: usize,
    /// Whether the broadcaster's negotiation is in flight.
    pub is_pending: bool,
    /// Whether the session owns media resources.
    pub has_media: bool,
    pub created_at: DateTime<Utc>,
}
