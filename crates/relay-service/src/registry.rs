//! Session Registry.
//!
//! Maps each broadcast ID to its [`Session`]. The registry is owned by the
//! relay actor and mutated only through the operations below; callers get
//! read-only views of sessions and never touch their internals.
//!
//! # Reservations
//!
//! When the relay owns media, a session or viewer is first *reserved* with an
//! attempt number before negotiation starts, then *confirmed* or *rolled back*
//! when negotiation completes. A completion whose attempt no longer matches
//! (the broadcast was stopped, the viewer left, or the connection dropped in
//! the meantime) is stale: its resources are released and nothing else
//! changes.
//!
//! # Media ownership
//!
//! Media resources are owned by the session. The registry releases them
//! exactly once: when the session is destroyed (pipeline), when a viewer is
//! removed (viewer endpoint), or when a stale confirmation is refused.

use crate::errors::RelayError;
use crate::media::negotiation::{spawn_add_candidate, spawn_release_endpoint, spawn_release_pipeline};
use crate::media::{MediaEndpoint, MediaResources};
use crate::signaling::IceCandidate;

use chrono::{DateTime, Utc};
use common::types::{BroadcastId, ConnectionId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reserved while the broadcaster's media is being negotiated.
    Pending { attempt: u64 },
    /// Live and joinable.
    Active,
}

/// A viewer whose media negotiation is in flight.
#[derive(Debug)]
struct PendingViewer {
    attempt: u64,
    candidates: Vec<IceCandidate>,
}

/// One broadcast's membership and resources.
pub struct Session {
    broadcast_id: BroadcastId,
    broadcaster: ConnectionId,
    state: SessionState,
    viewers: HashSet<ConnectionId>,
    pending_viewers: HashMap<ConnectionId, PendingViewer>,
    pending_offer: Option<String>,
    media: Option<MediaResources>,
    viewer_endpoints: HashMap<ConnectionId, Arc<dyn MediaEndpoint>>,
    buffered_candidates: Vec<IceCandidate>,
    created_at: DateTime<Utc>,
}

impl Session {
    fn new(
        broadcast_id: BroadcastId,
        broadcaster: ConnectionId,
        state: SessionState,
        pending_offer: Option<String>,
    ) -> Self {
        Self {
            broadcast_id,
            broadcaster,
            state,
            viewers: HashSet::new(),
            pending_viewers: HashMap::new(),
            pending_offer,
            media: None,
            viewer_endpoints: HashMap::new(),
            buffered_candidates: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Broadcast ID.
    #[must_use]
    pub fn broadcast_id(&self) -> &BroadcastId {
        &self.broadcast_id
    }

    /// Connection that owns the broadcast.
    #[must_use]
    pub fn broadcaster(&self) -> ConnectionId {
        self.broadcaster
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the broadcaster's negotiation is still in flight.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, SessionState::Pending { .. })
    }

    /// Whether `connection` is a confirmed viewer.
    #[must_use]
    pub fn has_viewer(&self, connection: &ConnectionId) -> bool {
        self.viewers.contains(connection)
    }

    /// Confirmed viewers.
    pub fn viewers(&self) -> impl Iterator<Item = &ConnectionId> {
        self.viewers.iter()
    }

    /// Number of confirmed viewers.
    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Number of viewers still negotiating.
    #[must_use]
    pub fn pending_viewer_count(&self) -> usize {
        self.pending_viewers.len()
    }

    /// The broadcaster's stored offer (signaling-only relays).
    #[must_use]
    pub fn pending_offer(&self) -> Option<&str> {
        self.pending_offer.as_deref()
    }

    /// Media resources, once the broadcaster's negotiation is confirmed.
    #[must_use]
    pub fn media(&self) -> Option<&MediaResources> {
        self.media.as_ref()
    }

    /// When the session was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Broadcaster plus confirmed viewers.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        std::iter::once(self.broadcaster)
            .chain(self.viewers.iter().copied())
            .collect()
    }

    /// Everyone to tell when the broadcast ends: confirmed and pending viewers.
    fn audience(&self) -> Vec<ConnectionId> {
        self.viewers
            .iter()
            .chain(self.pending_viewers.keys())
            .copied()
            .collect()
    }

    fn is_attempt(&self, attempt: u64) -> bool {
        self.state == SessionState::Pending { attempt }
    }

    fn is_member(&self, connection: &ConnectionId) -> bool {
        self.broadcaster == *connection
            || self.viewers.contains(connection)
            || self.pending_viewers.contains_key(connection)
    }

    /// Release everything this session owns.
    fn release_media(&mut self) {
        // Releasing the pipeline tears down every endpoint created on it
        self.viewer_endpoints.clear();
        if let Some(media) = self.media.take() {
            spawn_release_pipeline(media.pipeline);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("broadcast_id", &self.broadcast_id)
            .field("broadcaster", &self.broadcaster)
            .field("state", &self.state)
            .field("viewers", &self.viewers.len())
            .field("pending_viewers", &self.pending_viewers.len())
            .field("media", &self.media)
            .finish_non_exhaustive()
    }
}

/// What remains of a destroyed session: who needs to be told and whose
/// router entries to clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedSession {
    pub broadcast_id: BroadcastId,
    pub broadcaster: ConnectionId,
    /// Confirmed and pending viewers at the moment of destruction.
    pub audience: Vec<ConnectionId>,
}

/// Where a client candidate went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateRoute {
    /// Handed to the sender's endpoint.
    Delivered,
    /// Held until the sender's negotiation is confirmed.
    Buffered,
}

/// Broadcast ID -> session map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<BroadcastId, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an active session with the broadcaster's stored offer.
    ///
    /// Fails with `AlreadyExists` if the broadcast ID is taken (active or
    /// reserved); the existing session is left untouched.
    pub fn create_session(
        &mut self,
        broadcast_id: &BroadcastId,
        broadcaster: ConnectionId,
        offer: String,
    ) -> Result<&Session, RelayError> {
        self.insert(broadcast_id, broadcaster, SessionState::Active, Some(offer))
    }

    /// Reserve a session while the broadcaster's media is negotiated.
    pub fn reserve_session(
        &mut self,
        broadcast_id: &BroadcastId,
        broadcaster: ConnectionId,
        attempt: u64,
    ) -> Result<&Session, RelayError> {
        self.insert(
            broadcast_id,
            broadcaster,
            SessionState::Pending { attempt },
            None,
        )
    }

    fn insert(
        &mut self,
        broadcast_id: &BroadcastId,
        broadcaster: ConnectionId,
        state: SessionState,
        offer: Option<String>,
    ) -> Result<&Session, RelayError> {
        use std::collections::hash_map::Entry;

        match self.sessions.entry(broadcast_id.clone()) {
            Entry::Occupied(_) => Err(RelayError::AlreadyExists(broadcast_id.to_string())),
            Entry::Vacant(slot) => Ok(slot.insert(Session::new(
                broadcast_id.clone(),
                broadcaster,
                state,
                offer,
            ))),
        }
    }

    /// Confirm a reserved session with its negotiated media.
    ///
    /// Returns `false` (after releasing `resources`) if the reservation for
    /// `attempt` no longer exists. On success, candidates the broadcaster sent
    /// while negotiating are handed to its endpoint.
    pub fn confirm_session(
        &mut self,
        broadcast_id: &BroadcastId,
        attempt: u64,
        resources: MediaResources,
    ) -> bool {
        let Some(session) = self
            .sessions
            .get_mut(broadcast_id)
            .filter(|s| s.is_attempt(attempt))
        else {
            debug!(
                target: "relay.registry",
                broadcast_id = %broadcast_id,
                attempt = attempt,
                "Stale session confirmation, releasing pipeline"
            );
            spawn_release_pipeline(resources.pipeline);
            return false;
        };

        for candidate in session.buffered_candidates.drain(..) {
            spawn_add_candidate(Arc::clone(&resources.endpoint), candidate);
        }
        session.media = Some(resources);
        session.state = SessionState::Active;
        true
    }

    /// Remove a reserved session whose negotiation failed.
    ///
    /// Only the reservation for `attempt` is removed; returns whether it
    /// existed.
    pub fn rollback_session(&mut self, broadcast_id: &BroadcastId, attempt: u64) -> bool {
        let reserved = self
            .sessions
            .get(broadcast_id)
            .is_some_and(|s| s.is_attempt(attempt));
        if reserved {
            self.sessions.remove(broadcast_id);
        }
        reserved
    }

    /// Look up a session (active or reserved).
    pub fn get_session(&self, broadcast_id: &BroadcastId) -> Result<&Session, RelayError> {
        self.sessions
            .get(broadcast_id)
            .ok_or_else(|| RelayError::NotFound(broadcast_id.to_string()))
    }

    /// Whether a session (active or reserved) exists.
    #[must_use]
    pub fn contains(&self, broadcast_id: &BroadcastId) -> bool {
        self.sessions.contains_key(broadcast_id)
    }

    /// Add a confirmed viewer (signaling-only relays).
    ///
    /// Idempotent: returns `Ok(false)` if `connection` already views this
    /// broadcast. The broadcaster can never be its own viewer.
    pub fn add_viewer(
        &mut self,
        broadcast_id: &BroadcastId,
        connection: ConnectionId,
    ) -> Result<bool, RelayError> {
        let session = self.joinable_mut(broadcast_id)?;
        if session.broadcaster == connection {
            return Err(RelayError::AlreadyMember(broadcast_id.to_string()));
        }
        Ok(session.viewers.insert(connection))
    }

    /// Reserve a viewer slot while the viewer's media is negotiated.
    pub fn reserve_viewer(
        &mut self,
        broadcast_id: &BroadcastId,
        connection: ConnectionId,
        attempt: u64,
    ) -> Result<(), RelayError> {
        let session = self.joinable_mut(broadcast_id)?;
        if session.is_member(&connection) {
            return Err(RelayError::AlreadyMember(broadcast_id.to_string()));
        }
        session.pending_viewers.insert(
            connection,
            PendingViewer {
                attempt,
                candidates: Vec::new(),
            },
        );
        Ok(())
    }

    /// Confirm a reserved viewer with its negotiated endpoint.
    ///
    /// Returns `false` (after releasing `endpoint`) if the reservation for
    /// `attempt` no longer exists.
    pub fn confirm_viewer(
        &mut self,
        broadcast_id: &BroadcastId,
        connection: ConnectionId,
        attempt: u64,
        endpoint: Arc<dyn MediaEndpoint>,
    ) -> bool {
        let session = self.sessions.get_mut(broadcast_id).filter(|s| {
            s.pending_viewers
                .get(&connection)
                .is_some_and(|p| p.attempt == attempt)
        });

        let Some(session) = session else {
            debug!(
                target: "relay.registry",
                broadcast_id = %broadcast_id,
                connection_id = %connection,
                attempt = attempt,
                "Stale viewer confirmation, releasing endpoint"
            );
            spawn_release_endpoint(endpoint);
            return false;
        };

        let buffered = session
            .pending_viewers
            .remove(&connection)
            .map(|p| p.candidates)
            .unwrap_or_default();
        for candidate in buffered {
            spawn_add_candidate(Arc::clone(&endpoint), candidate);
        }
        session.viewers.insert(connection);
        session.viewer_endpoints.insert(connection, endpoint);
        true
    }

    /// Drop a viewer reservation whose negotiation failed.
    pub fn cancel_viewer(
        &mut self,
        broadcast_id: &BroadcastId,
        connection: ConnectionId,
        attempt: u64,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(broadcast_id) else {
            return false;
        };
        let matches = session
            .pending_viewers
            .get(&connection)
            .is_some_and(|p| p.attempt == attempt);
        if matches {
            session.pending_viewers.remove(&connection);
        }
        matches
    }

    /// Remove a viewer (confirmed or pending), releasing its endpoint.
    ///
    /// No-op if the session is absent or the connection never joined.
    pub fn remove_viewer(&mut self, broadcast_id: &BroadcastId, connection: &ConnectionId) -> bool {
        let Some(session) = self.sessions.get_mut(broadcast_id) else {
            return false;
        };

        let was_viewer = session.viewers.remove(connection);
        let was_pending = session.pending_viewers.remove(connection).is_some();
        if let Some(endpoint) = session.viewer_endpoints.remove(connection) {
            spawn_release_endpoint(endpoint);
        }
        was_viewer || was_pending
    }

    /// Hand a client candidate to the sender's own endpoint.
    ///
    /// Candidates from a member whose negotiation is still in flight are
    /// buffered and flushed on confirmation.
    pub fn route_candidate(
        &mut self,
        broadcast_id: &BroadcastId,
        connection: &ConnectionId,
        candidate: IceCandidate,
    ) -> Result<CandidateRoute, RelayError> {
        let session = self
            .sessions
            .get_mut(broadcast_id)
            .ok_or_else(|| RelayError::NotFound(broadcast_id.to_string()))?;

        if session.broadcaster == *connection {
            return match &session.media {
                Some(media) => {
                    spawn_add_candidate(Arc::clone(&media.endpoint), candidate);
                    Ok(CandidateRoute::Delivered)
                }
                None => {
                    session.buffered_candidates.push(candidate);
                    Ok(CandidateRoute::Buffered)
                }
            };
        }

        if let Some(endpoint) = session.viewer_endpoints.get(connection) {
            spawn_add_candidate(Arc::clone(endpoint), candidate);
            return Ok(CandidateRoute::Delivered);
        }

        if let Some(pending) = session.pending_viewers.get_mut(connection) {
            pending.candidates.push(candidate);
            return Ok(CandidateRoute::Buffered);
        }

        Err(RelayError::InvalidMessage(
            "Not a member of this broadcast".to_string(),
        ))
    }

    /// Destroy a session and release its media.
    ///
    /// Returns `None` if the session was already gone, so calling this twice
    /// is harmless.
    pub fn destroy_session(&mut self, broadcast_id: &BroadcastId) -> Option<EndedSession> {
        let mut session = self.sessions.remove(broadcast_id)?;
        session.release_media();
        Some(EndedSession {
            audience: session.audience(),
            broadcast_id: session.broadcast_id,
            broadcaster: session.broadcaster,
        })
    }

    /// Destroy every session (relay shutdown).
    pub fn drain(&mut self) -> Vec<EndedSession> {
        let ids: Vec<BroadcastId> = self.sessions.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.destroy_session(id))
            .collect()
    }

    /// Number of sessions (active or reserved).
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Confirmed viewers across all sessions.
    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.sessions.values().map(Session::viewer_count).sum()
    }

    /// Active session to join: reserved sessions are not joinable yet.
    fn joinable_mut(&mut self, broadcast_id: &BroadcastId) -> Result<&mut Session, RelayError> {
        self.sessions
            .get_mut(broadcast_id)
            .filter(|s| !s.is_pending())
            .ok_or_else(|| RelayError::NotFound(broadcast_id.to_string()))
    }
}
