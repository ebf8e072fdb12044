//! `RelayActor` - the event dispatcher.
//!
//! The `RelayActor` is the single serialization point of the relay:
//!
//! - Singleton per relay instance
//! - Owns the Session Registry, the Connection Router and every connection's
//!   outbound handle
//! - Processes one `RelayMessage` at a time, so every registry/router
//!   mutation is atomic with respect to every other
//! - Owns the root `CancellationToken` for graceful shutdown
//!
//! # Media negotiation
//!
//! When a media server is configured, `start` and `join` reserve their slot
//! in the registry and spawn the negotiation pipeline. The pipeline never
//! touches the registry; it reports back with `StartNegotiated` /
//! `JoinNegotiated` carrying the attempt number, and the actor confirms or
//! rolls back the reservation:
//!
//! ```text
//! start/join ──reserve──> Pending ──negotiated ok──> Active / viewer confirmed
//!                            │
//!                            ├──negotiation failed──> rolled back, error to client
//!                            └──stop/disconnect first──> completion is stale, resources released
//! ```
//!
//! # Slow clients
//!
//! Outbound queues are bounded and never awaited. A connection whose queue
//! cannot take an event is evicted after the current message: it is cleaned
//! up exactly like a transport disconnect and its queue is closed, so the
//! transport closes the socket.
//!
//! # Graceful Shutdown
//!
//! On shutdown the actor:
//! 1. Sets `accepting_new = false` (`start`/`join`/connect get `Draining`)
//! 2. Ends every broadcast (viewers get `broadcastEnded`, media is released)
//! 3. Cancels the root `CancellationToken` (propagates to the servers)

use crate::config::{Config, DuplicateStartPolicy};
use crate::errors::RelayError;
use crate::media::negotiation::{
    negotiate_broadcaster, negotiate_viewer, release_endpoint, release_pipeline,
    BroadcasterNegotiation, ViewerNegotiation,
};
use crate::media::{MediaError, MediaServer};
use crate::observability::metrics as prom;
use crate::registry::{EndedSession, SessionRegistry};
use crate::router::{ConnectionRouter, Role};
use crate::signaling::{ClientEvent, IceCandidate, ServerEvent};

use super::connection::{ConnectionHandle, OutboundReceiver};
use super::messages::{BroadcastInfo, RelayMessage, RelayStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{BroadcastId, ConnectionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the relay mailbox.
const RELAY_CHANNEL_BUFFER: usize = 1000;

/// Dispatch rules that come from configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Duplicate `start` handling when the relay does not own media.
    pub duplicate_start: DuplicateStartPolicy,
    /// Maximum concurrent broadcasts.
    pub max_broadcasts: usize,
    /// Maximum viewers (confirmed and negotiating) per broadcast.
    pub max_viewers_per_broadcast: usize,
    /// Bound on each media collaborator call.
    pub negotiation_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            duplicate_start: DuplicateStartPolicy::Ignore,
            max_broadcasts: crate::config::DEFAULT_MAX_BROADCASTS,
            max_viewers_per_broadcast: crate::config::DEFAULT_MAX_VIEWERS_PER_BROADCAST,
            negotiation_timeout: Duration::from_secs(
                crate::config::DEFAULT_NEGOTIATION_TIMEOUT_SECONDS,
            ),
        }
    }
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            duplicate_start: config.duplicate_start,
            max_broadcasts: config.max_broadcasts,
            max_viewers_per_broadcast: config.max_viewers_per_broadcast,
            negotiation_timeout: config.negotiation_timeout(),
        }
    }
}

/// Handle to the `RelayActor`.
///
/// This is the public interface for interacting with the relay. Cloning is
/// cheap; every transport task holds one.
#[derive(Clone, Debug)]
pub struct RelayActorHandle {
    sender: mpsc::Sender<RelayMessage>,
    cancel_token: CancellationToken,
}

impl RelayActorHandle {
    /// Create a new `RelayActor` and return a handle to it.
    ///
    /// Pass `media` to have the relay terminate media through a media
    /// server; with `None` the relay only forwards signaling.
    #[must_use]
    pub fn new(
        relay_id: String,
        settings: RelaySettings,
        media: Option<Arc<dyn MediaServer>>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (handle, _task_handle) = RelayActor::spawn(relay_id, settings, media, metrics);
        handle
    }

    /// Register a new connection.
    ///
    /// Returns the connection's ID and the receiver for events addressed to
    /// it. Fails with `Draining` once shutdown has begun.
    pub async fn connect(&self) -> Result<(ConnectionId, OutboundReceiver), RelayError> {
        let connection_id = ConnectionId::new();
        let (connection, outbound) = ConnectionHandle::channel(connection_id);

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RelayMessage::Connect {
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))??;

        Ok((connection_id, outbound))
    }

    /// Queue an inbound event. Results are delivered on the connection's
    /// outbound receiver.
    pub async fn dispatch(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RelayError> {
        self.send(RelayMessage::Event {
            connection_id,
            event,
        })
        .await
    }

    /// Decode and queue an inbound text frame.
    ///
    /// Undecodable frames are answered with an `error` event through the
    /// same mailbox, so they stay ordered with the connection's other events.
    pub async fn dispatch_frame(
        &self,
        connection_id: ConnectionId,
        text: &str,
    ) -> Result<(), RelayError> {
        match ClientEvent::from_json(text) {
            Ok(event) => self.dispatch(connection_id, event).await,
            Err(error) => {
                self.send(RelayMessage::Malformed {
                    connection_id,
                    error,
                })
                .await
            }
        }
    }

    /// Notify the relay that a connection is gone.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), RelayError> {
        self.send(RelayMessage::Disconnect { connection_id }).await
    }

    /// Get the current relay status.
    pub async fn get_status(&self) -> Result<RelayStatus, RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RelayMessage::GetStatus { respond_to: tx }).await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Get a snapshot of one broadcast.
    pub async fn get_broadcast(
        &self,
        broadcast_id: BroadcastId,
    ) -> Result<BroadcastInfo, RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RelayMessage::GetBroadcast {
            broadcast_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RelayMessage::Shutdown { respond_to: tx }).await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for tasks that should stop with the relay.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    async fn send(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }
}

/// The `RelayActor` implementation.
pub struct RelayActor {
    /// Relay instance ID.
    relay_id: String,
    /// Message receiver.
    receiver: mpsc::Receiver<RelayMessage>,
    /// Sender used by negotiation tasks to report back. Weak so that the
    /// mailbox closes once every handle is dropped.
    self_sender: mpsc::WeakSender<RelayMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    registry: SessionRegistry,
    router: ConnectionRouter,
    /// Outbound handles of registered connections.
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Media server, when the relay terminates media.
    media: Option<Arc<dyn MediaServer>>,
    settings: RelaySettings,
    /// Last negotiation attempt number handed out.
    attempt_seq: u64,
    /// Whether the relay is accepting new connections and broadcasts.
    accepting_new: bool,
    /// Connections whose outbound queue overflowed, evicted once the
    /// current message is handled.
    evictions: Vec<ConnectionId>,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl RelayActor {
    /// Spawn the relay actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        relay_id: String,
        settings: RelaySettings,
        media: Option<Arc<dyn MediaServer>>,
        metrics: Arc<ActorMetrics>,
    ) -> (RelayActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(RELAY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Relay, &relay_id),
            relay_id,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            registry: SessionRegistry::new(),
            router: ConnectionRouter::new(),
            connections: HashMap::new(),
            media,
            settings,
            attempt_seq: 0,
            accepting_new: true,
            evictions: Vec::new(),
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RelayActorHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.actor", fields(relay_id = %self.relay_id))]
    async fn run(mut self) {
        info!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            media = self.media.is_some(),
            "RelayActor started"
        );

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor",
                        relay_id = %self.relay_id,
                        "RelayActor received cancellation signal"
                    );
                    self.graceful_shutdown();
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_depth(self.receiver.len());
                            self.handle_message(message);
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                            self.publish_population();
                        }
                        None => {
                            // Channel closed, exit
                            info!(
                                target: "relay.actor",
                                relay_id = %self.relay_id,
                                "RelayActor channel closed, exiting"
                            );
                            self.graceful_shutdown();
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            messages_processed = self.mailbox.messages_processed(),
            "RelayActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::Connect {
                connection,
                respond_to,
            } => {
                let result = self.register_connection(connection);
                let _ = respond_to.send(result);
            }

            RelayMessage::Event {
                connection_id,
                event,
            } => self.handle_event(connection_id, event),

            RelayMessage::Malformed {
                connection_id,
                error,
            } => {
                prom::record_event("malformed");
                self.reject(connection_id, "malformed", &error);
            }

            RelayMessage::Disconnect { connection_id } => self.handle_disconnect(connection_id),

            RelayMessage::Overflowed { connection_id } => self.schedule_eviction(connection_id),

            RelayMessage::StartNegotiated {
                broadcast_id,
                connection_id,
                attempt,
                result,
            } => self.on_start_negotiated(broadcast_id, connection_id, attempt, result),

            RelayMessage::JoinNegotiated {
                broadcast_id,
                connection_id,
                attempt,
                result,
            } => self.on_join_negotiated(broadcast_id, connection_id, attempt, result),

            RelayMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RelayMessage::GetBroadcast {
                broadcast_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_broadcast(&broadcast_id));
            }

            RelayMessage::Shutdown { respond_to } => {
                let _ = respond_to.send(self.initiate_shutdown());
            }
        }

        self.evict_slow_connections();
    }

    fn register_connection(&mut self, connection: ConnectionHandle) -> Result<(), RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }

        let connection_id = connection.connection_id();
        self.connections.insert(connection_id, connection);

        debug!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            connection_id = %connection_id,
            total_connections = self.connections.len(),
            "Connection registered"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Signaling events
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, connection_id: ConnectionId, event: ClientEvent) {
        let name = event.name();
        prom::record_event(name);

        if !self.connections.contains_key(&connection_id) {
            warn!(
                target: "relay.actor",
                relay_id = %self.relay_id,
                connection_id = %connection_id,
                event = name,
                "Event from unregistered connection dropped"
            );
            return;
        }

        let result = match event {
            ClientEvent::Start {
                broadcast_id,
                sdp_offer,
            } => self.handle_start(connection_id, broadcast_id, sdp_offer),
            ClientEvent::Join {
                broadcast_id,
                sdp_offer,
            } => self.handle_join(connection_id, broadcast_id, sdp_offer),
            ClientEvent::Answer {
                broadcast_id,
                sdp_answer,
            } => self.handle_answer(&broadcast_id, sdp_answer),
            ClientEvent::IceCandidate {
                broadcast_id,
                candidate,
            } => self.handle_ice_candidate(connection_id, &broadcast_id, candidate),
            ClientEvent::DisconnectRequest { broadcast_id } => {
                self.handle_stop(connection_id, broadcast_id.as_ref());
                Ok(())
            }
        };

        if let Err(e) = result {
            self.reject(connection_id, name, &e);
        }
    }

    fn handle_start(
        &mut self,
        connection_id: ConnectionId,
        broadcast_id: BroadcastId,
        sdp_offer: String,
    ) -> Result<(), RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }

        if self.registry.contains(&broadcast_id) {
            let reject = self.media.is_some()
                || self.settings.duplicate_start == DuplicateStartPolicy::Reject;
            if reject {
                return Err(RelayError::AlreadyExists(broadcast_id.to_string()));
            }
            debug!(
                target: "relay.actor",
                relay_id = %self.relay_id,
                broadcast_id = %broadcast_id,
                connection_id = %connection_id,
                "Duplicate start ignored, first broadcaster wins"
            );
            return Ok(());
        }

        if let Some(membership) = self.router.membership(&connection_id) {
            return Err(RelayError::AlreadyMember(
                membership.broadcast_id.to_string(),
            ));
        }

        if self.registry.len() >= self.settings.max_broadcasts {
            return Err(RelayError::CapacityExceeded(
                "Relay is at broadcast capacity".to_string(),
            ));
        }

        let Some(server) = self.media.clone() else {
            self.router
                .assign(connection_id, &broadcast_id, Role::Broadcaster)?;
            if let Err(e) = self
                .registry
                .create_session(&broadcast_id, connection_id, sdp_offer)
            {
                self.router.clear(&connection_id);
                return Err(e);
            }

            info!(
                target: "relay.actor",
                relay_id = %self.relay_id,
                broadcast_id = %broadcast_id,
                connection_id = %connection_id,
                total_broadcasts = self.registry.len(),
                "Broadcast started"
            );
            return Ok(());
        };

        let mailbox = self.mailbox_sender()?;
        let attempt = self.next_attempt();

        self.router
            .assign(connection_id, &broadcast_id, Role::Broadcaster)?;
        if let Err(e) = self
            .registry
            .reserve_session(&broadcast_id, connection_id, attempt)
        {
            self.router.clear(&connection_id);
            return Err(e);
        }

        debug!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            broadcast_id = %broadcast_id,
            connection_id = %connection_id,
            attempt = attempt,
            "Broadcast reserved, negotiating media"
        );

        let limit = self.settings.negotiation_timeout;
        tokio::spawn(async move {
            let result = negotiate_broadcaster(&*server, &broadcast_id, &sdp_offer, limit).await;
            report(
                &mailbox,
                RelayMessage::StartNegotiated {
                    broadcast_id,
                    connection_id,
                    attempt,
                    result,
                },
            )
            .await;
        });

        Ok(())
    }

    fn on_start_negotiated(
        &mut self,
        broadcast_id: BroadcastId,
        connection_id: ConnectionId,
        attempt: u64,
        result: Result<BroadcasterNegotiation, MediaError>,
    ) {
        match result {
            Ok(negotiation) => {
                let BroadcasterNegotiation {
                    resources,
                    sdp_answer,
                    candidates,
                } = negotiation;

                if !self
                    .registry
                    .confirm_session(&broadcast_id, attempt, resources)
                {
                    return;
                }

                // Answer first, so the client never sees a candidate before it
                self.send_to(connection_id, ServerEvent::StartResponse { sdp_answer });
                if let Some(connection) = self.connections.get(&connection_id) {
                    connection.spawn_candidate_forwarder(candidates, self.self_sender.clone());
                }

                info!(
                    target: "relay.actor",
                    relay_id = %self.relay_id,
                    broadcast_id = %broadcast_id,
                    connection_id = %connection_id,
                    total_broadcasts = self.registry.len(),
                    "Broadcast started"
                );
            }
            Err(e) => {
                if !self.registry.rollback_session(&broadcast_id, attempt) {
                    debug!(
                        target: "relay.actor",
                        relay_id = %self.relay_id,
                        broadcast_id = %broadcast_id,
                        attempt = attempt,
                        "Stale broadcaster negotiation failure ignored"
                    );
                    return;
                }
                self.router.clear_if(&connection_id, &broadcast_id);

                warn!(
                    target: "relay.actor",
                    relay_id = %self.relay_id,
                    broadcast_id = %broadcast_id,
                    connection_id = %connection_id,
                    error = %e,
                    "Broadcast start failed, reservation rolled back"
                );
                self.reject(connection_id, "start", &RelayError::from(e));
            }
        }
    }

    fn handle_join(
        &mut self,
        connection_id: ConnectionId,
        broadcast_id: BroadcastId,
        sdp_offer: Option<String>,
    ) -> Result<(), RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }

        let session = self.registry.get_session(&broadcast_id)?;
        if session.is_pending() {
            // Not joinable until the broadcaster's media is negotiated
            return Err(RelayError::NotFound(broadcast_id.to_string()));
        }
        let stored_offer = session.pending_offer().map(str::to_string);
        let resources = session.media().cloned();
        let at_capacity = session.viewer_count() + session.pending_viewer_count()
            >= self.settings.max_viewers_per_broadcast;

        if let Some(membership) = self.router.membership(&connection_id) {
            let rejoin = membership.broadcast_id == broadcast_id
                && membership.role == Role::Viewer
                && self.media.is_none();
            if !rejoin {
                return Err(RelayError::AlreadyMember(
                    membership.broadcast_id.to_string(),
                ));
            }

            // Already a viewer: hand out the stored offer again
            if let Some(sdp_offer) = stored_offer {
                self.send_to(connection_id, ServerEvent::Offer { sdp_offer });
            }
            return Ok(());
        }

        if at_capacity {
            return Err(RelayError::CapacityExceeded(
                "Broadcast is at viewer capacity".to_string(),
            ));
        }

        if self.media.is_none() {
            self.router
                .assign(connection_id, &broadcast_id, Role::Viewer)?;
            if let Err(e) = self.registry.add_viewer(&broadcast_id, connection_id) {
                self.router.clear(&connection_id);
                return Err(e);
            }

            if let Some(sdp_offer) = stored_offer {
                self.send_to(connection_id, ServerEvent::Offer { sdp_offer });
            }

            info!(
                target: "relay.actor",
                relay_id = %self.relay_id,
                broadcast_id = %broadcast_id,
                connection_id = %connection_id,
                "Viewer joined"
            );
            return Ok(());
        }

        let sdp_offer = sdp_offer.ok_or_else(|| {
            RelayError::InvalidMessage("join requires an sdpOffer".to_string())
        })?;
        let resources = resources.ok_or_else(|| {
            RelayError::Internal(format!("active broadcast {broadcast_id} has no media"))
        })?;
        let mailbox = self.mailbox_sender()?;
        let attempt = self.next_attempt();

        self.router
            .assign(connection_id, &broadcast_id, Role::Viewer)?;
        if let Err(e) = self
            .registry
            .reserve_viewer(&broadcast_id, connection_id, attempt)
        {
            self.router.clear(&connection_id);
            return Err(e);
        }

        debug!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            broadcast_id = %broadcast_id,
            connection_id = %connection_id,
            attempt = attempt,
            "Viewer reserved, negotiating media"
        );

        let limit = self.settings.negotiation_timeout;
        tokio::spawn(async move {
            let result = negotiate_viewer(&resources, &broadcast_id, &sdp_offer, limit).await;
            report(
                &mailbox,
                RelayMessage::JoinNegotiated {
                    broadcast_id,
                    connection_id,
                    attempt,
                    result,
                },
            )
            .await;
        });

        Ok(())
    }

    fn on_join_negotiated(
        &mut self,
        broadcast_id: BroadcastId,
        connection_id: ConnectionId,
        attempt: u64,
        result: Result<ViewerNegotiation, MediaError>,
    ) {
        match result {
            Ok(negotiation) => {
                let ViewerNegotiation {
                    endpoint,
                    sdp_answer,
                    candidates,
                } = negotiation;

                if !self
                    .registry
                    .confirm_viewer(&broadcast_id, connection_id, attempt, endpoint)
                {
                    return;
                }

                self.send_to(connection_id, ServerEvent::JoinResponse { sdp_answer });
                if let Some(connection) = self.connections.get(&connection_id) {
                    connection.spawn_candidate_forwarder(candidates, self.self_sender.clone());
                }

                info!(
                    target: "relay.actor",
                    relay_id = %self.relay_id,
                    broadcast_id = %broadcast_id,
                    connection_id = %connection_id,
                    "Viewer joined"
                );
            }
            Err(e) => {
                if !self
                    .registry
                    .cancel_viewer(&broadcast_id, connection_id, attempt)
                {
                    debug!(
                        target: "relay.actor",
                        relay_id = %self.relay_id,
                        broadcast_id = %broadcast_id,
                        connection_id = %connection_id,
                        attempt = attempt,
                        "Stale viewer negotiation failure ignored"
                    );
                    return;
                }
                self.router.clear_if(&connection_id, &broadcast_id);

                warn!(
                    target: "relay.actor",
                    relay_id = %self.relay_id,
                    broadcast_id = %broadcast_id,
                    connection_id = %connection_id,
                    error = %e,
                    "Viewer join failed, reservation rolled back"
                );
                self.reject(connection_id, "join", &RelayError::from(e));
            }
        }
    }

    fn handle_answer(
        &mut self,
        broadcast_id: &BroadcastId,
        sdp_answer: String,
    ) -> Result<(), RelayError> {
        if self.media.is_some() {
            return Err(RelayError::InvalidMessage(
                "answer is not used when the relay terminates media".to_string(),
            ));
        }

        let broadcaster = self.registry.get_session(broadcast_id)?.broadcaster();
        self.send_to(broadcaster, ServerEvent::Answer { sdp_answer });
        Ok(())
    }

    fn handle_ice_candidate(
        &mut self,
        connection_id: ConnectionId,
        broadcast_id: &BroadcastId,
        candidate: IceCandidate,
    ) -> Result<(), RelayError> {
        if self.media.is_some() {
            let route = self
                .registry
                .route_candidate(broadcast_id, &connection_id, candidate)?;
            debug!(
                target: "relay.actor",
                broadcast_id = %broadcast_id,
                connection_id = %connection_id,
                route = ?route,
                "Candidate routed to endpoint"
            );
            return Ok(());
        }

        let members = self.registry.get_session(broadcast_id)?.members();
        if !members.contains(&connection_id) {
            return Err(RelayError::InvalidMessage(format!(
                "connection is not a member of broadcast {broadcast_id}"
            )));
        }
        for member in members.into_iter().filter(|m| *m != connection_id) {
            self.send_to(
                member,
                ServerEvent::IceCandidate {
                    candidate: candidate.clone(),
                },
            );
        }
        Ok(())
    }

    /// Explicit stop (broadcaster) or leave (viewer).
    fn handle_stop(&mut self, connection_id: ConnectionId, requested: Option<&BroadcastId>) {
        let Some(membership) = self.router.membership(&connection_id).cloned() else {
            debug!(
                target: "relay.actor",
                connection_id = %connection_id,
                "Stop from connection without membership ignored"
            );
            return;
        };

        if requested.is_some_and(|id| *id != membership.broadcast_id) {
            debug!(
                target: "relay.actor",
                connection_id = %connection_id,
                broadcast_id = %membership.broadcast_id,
                "Stop for another broadcast ignored"
            );
            return;
        }

        let message = match membership.role {
            Role::Broadcaster => {
                self.end_broadcast(&membership.broadcast_id, "stopped");
                "Broadcast stopped"
            }
            Role::Viewer => {
                self.detach_viewer(connection_id, &membership.broadcast_id);
                "Left broadcast"
            }
        };
        self.send_to(
            connection_id,
            ServerEvent::StopResponse {
                message: message.to_string(),
            },
        );
    }

    // ------------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------------

    fn handle_disconnect(&mut self, connection_id: ConnectionId) {
        let Some(connection) = self.connections.remove(&connection_id) else {
            debug!(
                target: "relay.actor",
                connection_id = %connection_id,
                "Disconnect for unknown connection ignored"
            );
            return;
        };
        connection.close();

        if let Some(membership) = self.router.membership(&connection_id).cloned() {
            match membership.role {
                Role::Broadcaster => {
                    self.end_broadcast(&membership.broadcast_id, "broadcaster_disconnected");
                }
                Role::Viewer => self.detach_viewer(connection_id, &membership.broadcast_id),
            }
        }

        debug!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            connection_id = %connection_id,
            total_connections = self.connections.len(),
            "Connection disconnected"
        );
    }

    /// Destroy a session and tell its viewers. No-op if already gone.
    fn end_broadcast(&mut self, broadcast_id: &BroadcastId, reason: &'static str) {
        if let Some(ended) = self.registry.destroy_session(broadcast_id) {
            self.finish_ended(ended, reason);
        }
    }

    fn finish_ended(&mut self, ended: EndedSession, reason: &'static str) {
        self.router.clear(&ended.broadcaster);
        for viewer in &ended.audience {
            self.router.clear(viewer);
            self.send_to(
                *viewer,
                ServerEvent::BroadcastEnded {
                    broadcast_id: ended.broadcast_id.clone(),
                },
            );
        }

        info!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            broadcast_id = %ended.broadcast_id,
            viewers_notified = ended.audience.len(),
            reason = reason,
            total_broadcasts = self.registry.len(),
            "Broadcast ended"
        );
    }

    fn detach_viewer(&mut self, connection_id: ConnectionId, broadcast_id: &BroadcastId) {
        self.registry.remove_viewer(broadcast_id, &connection_id);
        self.router.clear(&connection_id);

        info!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            broadcast_id = %broadcast_id,
            connection_id = %connection_id,
            "Viewer left"
        );
    }

    // ------------------------------------------------------------------------
    // Queries and shutdown
    // ------------------------------------------------------------------------

    fn get_status(&self) -> RelayStatus {
        RelayStatus {
            broadcast_count: self.registry.len(),
            viewer_count: self.registry.viewer_count(),
            connection_count: self.connections.len(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn get_broadcast(&self, broadcast_id: &BroadcastId) -> Result<BroadcastInfo, RelayError> {
        let session = self.registry.get_session(broadcast_id)?;

        let mut viewers: Vec<ConnectionId> = session.viewers().copied().collect();
        viewers.sort();

        Ok(BroadcastInfo {
            broadcast_id: session.broadcast_id().clone(),
            broadcaster: session.broadcaster(),
            viewers,
            pending_viewers: session.pending_viewer_count(),
            is_pending: session.is_pending(),
            has_media: session.media().is_some(),
            created_at: session.created_at(),
        })
    }

    fn initiate_shutdown(&mut self) -> Result<(), RelayError> {
        info!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            broadcast_count = self.registry.len(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.end_all_broadcasts();

        // Cancel the root token (propagates to the servers)
        self.cancel_token.cancel();
        Ok(())
    }

    fn graceful_shutdown(&mut self) {
        self.accepting_new = false;
        self.end_all_broadcasts();

        // Ending every outbound queue closes the sockets
        for (_, connection) in self.connections.drain() {
            connection.close();
        }
        self.publish_population();

        info!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            "Graceful shutdown complete"
        );
    }

    fn end_all_broadcasts(&mut self) {
        for ended in self.registry.drain() {
            self.finish_ended(ended, "relay_shutdown");
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Answer a failed request with one `error` event.
    fn reject(&mut self, connection_id: ConnectionId, event: &'static str, err: &RelayError) {
        prom::record_event_error(err.kind());
        debug!(
            target: "relay.actor",
            relay_id = %self.relay_id,
            connection_id = %connection_id,
            event = event,
            error = %err,
            "Event rejected"
        );
        self.send_to(connection_id, ServerEvent::from_error(err));
    }

    /// Queue an event for a connection. A connection that cannot take it
    /// is evicted rather than left behind with a gap in its stream.
    fn send_to(&mut self, connection_id: ConnectionId, event: ServerEvent) {
        let Some(connection) = self.connections.get(&connection_id) else {
            return;
        };
        if let Err(RelayError::CapacityExceeded(_)) = connection.send(event) {
            self.schedule_eviction(connection_id);
        }
    }

    fn schedule_eviction(&mut self, connection_id: ConnectionId) {
        if !self.evictions.contains(&connection_id) {
            self.evictions.push(connection_id);
        }
    }

    /// Drop slow connections as if they had disconnected. Cleanup can
    /// overflow further queues, so this runs until nothing is left.
    fn evict_slow_connections(&mut self) {
        while let Some(connection_id) = self.evictions.pop() {
            if !self.connections.contains_key(&connection_id) {
                continue;
            }
            prom::record_connection_evicted();
            warn!(
                target: "relay.actor",
                relay_id = %self.relay_id,
                connection_id = %connection_id,
                "Evicting connection, outbound queue overflowed"
            );
            self.handle_disconnect(connection_id);
        }
    }

    fn next_attempt(&mut self) -> u64 {
        self.attempt_seq += 1;
        self.attempt_seq
    }

    fn mailbox_sender(&self) -> Result<mpsc::Sender<RelayMessage>, RelayError> {
        self.self_sender
            .upgrade()
            .ok_or_else(|| RelayError::Internal("relay mailbox closed".to_string()))
    }

    fn publish_population(&self) {
        self.metrics.set_population(
            self.registry.len(),
            self.registry.viewer_count(),
            self.connections.len(),
        );
    }
}

/// Hand a negotiation outcome back to the actor. If the actor is gone the
/// negotiated resources are released here instead.
async fn report(mailbox: &mpsc::Sender<RelayMessage>, message: RelayMessage) {
    let Err(mpsc::error::SendError(unsent)) = mailbox.send(message).await else {
        return;
    };

    match unsent {
        RelayMessage::StartNegotiated {
            result: Ok(negotiation),
            ..
        } => release_pipeline(&*negotiation.resources.pipeline).await,
        RelayMessage::JoinNegotiated {
            result: Ok(negotiation),
            ..
        } => release_endpoint(&*negotiation.endpoint).await,
        _ => {}
    }
}
