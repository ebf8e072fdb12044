//! Test fixtures: SDP payloads, candidates and relay constructors.
//!
//! The relay never parses SDP, so the payloads only need to be recognisable
//! when they come back out.

use relay_service::actors::{ActorMetrics, RelayActorHandle, RelaySettings};
use relay_service::config::DuplicateStartPolicy;
use relay_service::signaling::IceCandidate;

use crate::mock_media::MockMediaServer;

/// Offer sent by test broadcasters.
pub const BROADCASTER_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=broadcaster\r\n";

/// Offer sent by test viewers (media mode).
pub const VIEWER_OFFER: &str = "v=0\r\no=- 2 1 IN IP4 0.0.0.0\r\ns=viewer\r\n";

/// Answer sent by test viewers (signaling mode).
pub const VIEWER_ANSWER: &str = "v=0\r\no=- 3 1 IN IP4 0.0.0.0\r\ns=viewer-answer\r\n";

/// A host candidate numbered `n`.
#[must_use]
pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.0.2.{n} 5400{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    }
}

/// Spawn a signaling-only relay with default settings.
#[must_use]
pub fn spawn_signaling_relay() -> RelayActorHandle {
    spawn_signaling_relay_with(RelaySettings::default())
}

/// Spawn a signaling-only relay with the given duplicate-start policy.
#[must_use]
pub fn spawn_signaling_relay_with_policy(policy: DuplicateStartPolicy) -> RelayActorHandle {
    spawn_signaling_relay_with(RelaySettings {
        duplicate_start: policy,
        ..RelaySettings::default()
    })
}

/// Spawn a signaling-only relay with custom settings.
#[must_use]
pub fn spawn_signaling_relay_with(settings: RelaySettings) -> RelayActorHandle {
    RelayActorHandle::new(
        "relay-test".to_string(),
        settings,
        None,
        ActorMetrics::new(),
    )
}

/// Spawn a relay that terminates media through `media`.
#[must_use]
pub fn spawn_media_relay(media: &MockMediaServer) -> RelayActorHandle {
    spawn_media_relay_with(media, RelaySettings::default())
}

/// Spawn a media relay with custom settings.
#[must_use]
pub fn spawn_media_relay_with(media: &MockMediaServer, settings: RelaySettings) -> RelayActorHandle {
    RelayActorHandle::new(
        "relay-test".to_string(),
        settings,
        Some(media.as_server()),
        ActorMetrics::new(),
    )
}
