//! Connection Router.
//!
//! Tracks, for each live connection, the one broadcast it belongs to and in
//! which role. Disconnect cleanup resolves a connection's membership here in
//! O(1) instead of scanning every session.
//!
//! The router is updated by the relay actor in the same message that mutates
//! the session registry, so the two never disagree between messages.

use crate::errors::RelayError;
use common::types::{BroadcastId, ConnectionId};
use std::collections::HashMap;

/// Role of a connection within its broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Originated the broadcast via `start`.
    Broadcaster,
    /// Subscribed via `join` (confirmed or still negotiating).
    Viewer,
}

impl Role {
    /// Returns the role as a string for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Broadcaster => "broadcaster",
            Role::Viewer => "viewer",
        }
    }
}

/// A connection's current membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Broadcast the connection belongs to.
    pub broadcast_id: BroadcastId,
    /// Role within that broadcast.
    pub role: Role,
}

/// Connection -> membership index.
#[derive(Debug, Default)]
pub struct ConnectionRouter {
    memberships: HashMap<ConnectionId, Membership>,
}

impl ConnectionRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `connection` as a member of `broadcast_id`.
    ///
    /// Re-assigning the identical membership is a no-op. A connection that
    /// already belongs to a broadcast (in any other role or broadcast) is
    /// rejected: a client is a member of exactly one broadcast, in exactly
    /// one role.
    pub fn assign(
        &mut self,
        connection: ConnectionId,
        broadcast_id: &BroadcastId,
        role: Role,
    ) -> Result<(), RelayError> {
        match self.memberships.get(&connection) {
            Some(existing) if existing.broadcast_id == *broadcast_id && existing.role == role => {
                Ok(())
            }
            Some(existing) => Err(RelayError::AlreadyMember(
                existing.broadcast_id.to_string(),
            )),
            None => {
                self.memberships.insert(
                    connection,
                    Membership {
                        broadcast_id: broadcast_id.clone(),
                        role,
                    },
                );
                Ok(())
            }
        }
    }

    /// Current membership of `connection`, if any.
    #[must_use]
    pub fn membership(&self, connection: &ConnectionId) -> Option<&Membership> {
        self.memberships.get(connection)
    }

    /// Remove `connection`'s membership, returning it.
    pub fn clear(&mut self, connection: &ConnectionId) -> Option<Membership> {
        self.memberships.remove(connection)
    }

    /// Remove `connection`'s membership only if it points at `broadcast_id`.
    ///
    /// Used when rolling back a failed negotiation: by then the connection
    /// may have left and joined something else.
    pub fn clear_if(&mut self, connection: &ConnectionId, broadcast_id: &BroadcastId) -> bool {
        let matches = self
            .memberships
            .get(connection)
            .is_some_and(|m| m.broadcast_id == *broadcast_id);
        if matches {
            self.memberships.remove(connection);
        }
        matches
    }

    /// Number of connections with a membership.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memberships.len()
    }

    /// Whether no connection has a membership.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memberships.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_and_resolve() {
        let mut router = ConnectionRouter::new();
        let conn = ConnectionId::new();
        let room = BroadcastId::new("room1");

        router.assign(conn, &room, Role::Broadcaster).unwrap();

        let membership = router.membership(&conn).unwrap();
        assert_eq!(membership.broadcast_id, room);
        assert_eq!(membership.role, Role::Broadcaster);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_assign_same_membership_is_idempotent() {
        let mut router = ConnectionRouter::new();
        let conn = ConnectionId::new();
        let room = BroadcastId::new("room1");

        router.assign(conn, &room, Role::Viewer).unwrap();
        router.assign(conn, &room, Role::Viewer).unwrap();
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_one_membership_per_connection() {
        let mut router = ConnectionRouter::new();
        let conn = ConnectionId::new();

        router
            .assign(conn, &BroadcastId::new("room1"), Role::Viewer)
            .unwrap();

        let other_room = router.assign(conn, &BroadcastId::new("room2"), Role::Viewer);
        assert!(matches!(other_room, Err(RelayError::AlreadyMember(b)) if b == "room1"));

        let other_role = router.assign(conn, &BroadcastId::new("room1"), Role::Broadcaster);
        assert!(matches!(other_role, Err(RelayError::AlreadyMember(_))));
    }

    #[test]
    fn test_clear() {
        let mut router = ConnectionRouter::new();
        let conn = ConnectionId::new();
        let room = BroadcastId::new("room1");

        router.assign(conn, &room, Role::Viewer).unwrap();
        assert_eq!(router.clear(&conn).map(|m| m.role), Some(Role::Viewer));
        assert!(router.membership(&conn).is_none());

        // Clearing twice is a no-op
        assert!(router.clear(&conn).is_none());
        assert!(router.is_empty());
    }

    #[test]
    fn test_clear_if_only_matches_same_broadcast() {
        let mut router = ConnectionRouter::new();
        let conn = ConnectionId::new();
        let room1 = BroadcastId::new("room1");
        let room2 = BroadcastId::new("room2");

        router.assign(conn, &room2, Role::Viewer).unwrap();

        assert!(!router.clear_if(&conn, &room1));
        assert!(router.membership(&conn).is_some());

        assert!(router.clear_if(&conn, &room2));
        assert!(router.membership(&conn).is_none());
    }
}
