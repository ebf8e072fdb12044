//! Outbound side of a signaling connection.
//!
//! Every connection gets a bounded outbound queue. The relay actor and the
//! candidate forwarders push [`ServerEvent`]s into it without awaiting; the
//! transport drains it into the socket.
//!
//! Relayed peer traffic (offers, answers, candidates) may fill the queue up
//! to [`CONNECTION_CHANNEL_BUFFER`]. The last [`LIFECYCLE_HEADROOM`] slots are
//! kept for lifecycle events, so a client that stopped reading still gets
//! its `broadcastEnded`. A client that overflows is evicted by the relay: its
//! handle is closed, the queue ends and the transport closes the socket.

use crate::errors::RelayError;
use crate::signaling::{IceCandidate, ServerEvent};

use super::messages::RelayMessage;
use super::metrics::{ActorType, MailboxMonitor};

use common::types::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outbound queue capacity per connection for relayed peer traffic.
pub const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Extra outbound slots only lifecycle events may use.
pub const LIFECYCLE_HEADROOM: usize = 16;

/// Receiving end of a connection's outbound queue, owned by the transport.
pub type OutboundReceiver = mpsc::Receiver<ServerEvent>;

/// Handle used to deliver events to one connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    sender: mpsc::Sender<ServerEvent>,
    mailbox: Arc<MailboxMonitor>,
    /// Cancelled when the relay lets go of the connection; stops the
    /// forwarders holding clones of this handle.
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiver the transport drains.
    #[must_use]
    pub fn channel(connection_id: ConnectionId) -> (Self, OutboundReceiver) {
        Self::with_capacity(connection_id, CONNECTION_CHANNEL_BUFFER)
    }

    /// Create a handle whose relayed traffic is limited to `capacity`.
    #[must_use]
    pub fn with_capacity(connection_id: ConnectionId, capacity: usize) -> (Self, OutboundReceiver) {
        let (sender, receiver) = mpsc::channel(capacity + LIFECYCLE_HEADROOM);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
        ));

        (
            Self {
                connection_id,
                sender,
                mailbox,
                closed: CancellationToken::new(),
            },
            receiver,
        )
    }

    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue an event for the client without waiting.
    ///
    /// Fails with `CapacityExceeded` when the event does not fit (relayed
    /// traffic past its share, or lifecycle events past the headroom); the
    /// caller must evict the connection. Fails with `Internal` if the
    /// transport has gone away.
    pub fn send(&self, event: ServerEvent) -> Result<(), RelayError> {
        if event.is_relayed() && self.sender.capacity() <= LIFECYCLE_HEADROOM {
            self.mailbox.record_drop();
            return Err(RelayError::CapacityExceeded(
                "Outbound queue full".to_string(),
            ));
        }

        match self.sender.try_send(event) {
            Ok(()) => {
                self.mailbox
                    .record_depth(self.sender.max_capacity() - self.sender.capacity());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                Err(RelayError::CapacityExceeded(
                    "Outbound queue full".to_string(),
                ))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    "Outbound queue closed, dropping event"
                );
                Err(RelayError::Internal("connection closed".to_string()))
            }
        }
    }

    /// Release the connection: stops its candidate forwarders so that, once
    /// the relay drops its own handle, the outbound queue ends.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the transport has stopped draining this queue.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Messages dropped because the queue was full.
    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.mailbox.messages_dropped()
    }

    /// Relay candidates discovered by a media endpoint to this client until
    /// the endpoint goes away or the connection is closed.
    ///
    /// An overflow is reported to the relay as `Overflowed` and ends the
    /// forwarder.
    pub fn spawn_candidate_forwarder(
        &self,
        mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
        relay: mpsc::WeakSender<RelayMessage>,
    ) {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                let candidate = tokio::select! {
                    biased;
                    () = handle.closed.cancelled() => break,
                    next = candidates.recv() => match next {
                        Some(candidate) => candidate,
                        None => break,
                    },
                };

                match handle.send(ServerEvent::IceCandidate { candidate }) {
                    Ok(()) => {}
                    Err(RelayError::CapacityExceeded(_)) => {
                        if let Some(relay) = relay.upgrade() {
                            let _ = relay
                                .send(RelayMessage::Overflowed {
                                    connection_id: handle.connection_id,
                                })
                                .await;
                        }
                        break;
                    }
                    Err(_) => break,
                }
            }
            debug!(
                target: "relay.actor.connection",
                connection_id = %handle.connection_id,
                "Candidate forwarder finished"
            );
        });
    }
}
