//! Common data types for the broadcast relay.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Client-supplied identifier of a broadcast.
///
/// Opaque to the relay: it is only ever compared for equality and used as a
/// map key, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcastId(pub String);

impl BroadcastId {
    /// Wrap a client-supplied identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BroadcastId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier for a client connection, assigned by the transport at
/// connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_broadcast_id_serializes_as_plain_string() {
        let id = BroadcastId::new("room1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"room1\"");

        let parsed: BroadcastId = serde_json::from_str("\"room1\"").unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.to_string(), "room1");
    }
}
