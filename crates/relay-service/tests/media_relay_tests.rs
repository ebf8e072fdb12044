//! Integration tests for the relay when it terminates media.
//!
//! Uses `MockMediaServer` to script negotiation outcomes and to check that
//! every pipeline and endpoint handed out is eventually released.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::BroadcastId;
use relay_service::actors::RelaySettings;
use relay_service::signaling::ServerEvent;
use relay_test_utils::*;
use std::time::Duration;

const BAD_REQUEST: i32 = 1;
const NOT_FOUND: i32 = 4;
const CONFLICT: i32 = 5;
const NEGOTIATION: i32 = 8;

/// Poll `condition` for up to a second.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn expect_start_response(client: &mut TestClient) -> String {
    match client.recv().await {
        ServerEvent::StartResponse { sdp_answer } => sdp_answer,
        other => panic!("expected startResponse, got {other:?}"),
    }
}

async fn expect_join_response(client: &mut TestClient) -> String {
    match client.recv().await {
        ServerEvent::JoinResponse { sdp_answer } => sdp_answer,
        other => panic!("expected joinResponse, got {other:?}"),
    }
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_media_broadcast_session() {
    let media = MockMediaServer::builder().candidates_per_endpoint(2).build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;
    let mut viewer = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;

    // Answer first, then the endpoint's candidates
    let answer = expect_start_response(&mut broadcaster).await;
    assert!(answer.starts_with("answer-from-endpoint-"));
    for _ in 0..2 {
        assert!(matches!(
            broadcaster.recv().await,
            ServerEvent::IceCandidate { .. }
        ));
    }

    viewer.join_with_offer("room1", VIEWER_OFFER).await;
    let answer = expect_join_response(&mut viewer).await;
    assert!(answer.ends_with(VIEWER_OFFER));
    for _ in 0..2 {
        assert!(matches!(viewer.recv().await, ServerEvent::IceCandidate { .. }));
    }

    assert_eq!(media.pipelines_created(), 1);
    assert_eq!(media.endpoints_created(), 2);
    assert_eq!(media.connections().len(), 1);

    let info = relay.get_broadcast(BroadcastId::new("room1")).await.unwrap();
    assert!(info.has_media);
    assert!(!info.is_pending);
    assert_eq!(info.viewers, vec![viewer.id()]);

    // Broadcaster leaves: viewer told, everything released
    broadcaster.disconnect().await;
    loop {
        match viewer.recv().await {
            ServerEvent::BroadcastEnded { broadcast_id } => {
                assert_eq!(broadcast_id, BroadcastId::new("room1"));
                break;
            }
            ServerEvent::IceCandidate { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    media.wait_for_no_leaks().await;

    relay.cancel();
}

#[tokio::test]
async fn test_viewer_leave_releases_only_its_endpoint() {
    let media = MockMediaServer::builder().build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;
    let mut viewer = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    expect_start_response(&mut broadcaster).await;
    viewer.join_with_offer("room1", VIEWER_OFFER).await;
    expect_join_response(&mut viewer).await;
    assert_eq!(media.live_endpoints(), 2);

    viewer.stop(Some("room1")).await;
    assert_eq!(
        viewer.recv().await,
        ServerEvent::StopResponse {
            message: "Left broadcast".to_string()
        }
    );

    wait_until("viewer endpoint release", || media.endpoints_released() == 1).await;
    assert_eq!(media.live_pipelines(), 1);
    assert_eq!(media.live_endpoints(), 1);

    broadcaster.stop(None).await;
    broadcaster.recv().await;
    media.wait_for_no_leaks().await;

    relay.cancel();
}

// ============================================================================
// Rollback on stage failure
// ============================================================================

#[tokio::test]
async fn test_start_failure_at_each_stage_rolls_back() {
    for stage in [
        FailAt::CreatePipeline,
        FailAt::CreateEndpoint,
        FailAt::ProcessOffer,
        FailAt::GatherCandidates,
    ] {
        let media = MockMediaServer::builder().fail_at(stage).build();
        let relay = spawn_media_relay(&media);
        let mut broadcaster = TestClient::connect(&relay).await;

        broadcaster.start("room1", BROADCASTER_OFFER).await;
        let message = broadcaster.expect_error(NEGOTIATION).await;
        assert_eq!(message, "Error processing offer", "stage {stage:?}");

        assert_eq!(
            relay.get_status().await.unwrap().broadcast_count,
            0,
            "stage {stage:?}"
        );
        media.wait_for_no_leaks().await;

        // The ID and the connection are free again
        media.set_fail_at(None);
        broadcaster.start("room1", BROADCASTER_OFFER).await;
        expect_start_response(&mut broadcaster).await;

        relay.cancel();
    }
}

#[tokio::test]
async fn test_viewer_failure_at_each_stage_rolls_back() {
    for stage in [
        FailAt::CreateEndpoint,
        FailAt::ProcessOffer,
        FailAt::GatherCandidates,
        FailAt::Connect,
    ] {
        let media = MockMediaServer::builder().build();
        let relay = spawn_media_relay(&media);
        let mut broadcaster = TestClient::connect(&relay).await;
        let mut viewer = TestClient::connect(&relay).await;

        broadcaster.start("room1", BROADCASTER_OFFER).await;
        expect_start_response(&mut broadcaster).await;

        media.set_fail_at(Some(stage));
        viewer.join_with_offer("room1", VIEWER_OFFER).await;
        viewer.expect_error(NEGOTIATION).await;

        // Broadcast untouched, viewer's endpoint (if any) released
        let info = relay.get_broadcast(BroadcastId::new("room1")).await.unwrap();
        assert!(info.viewers.is_empty(), "stage {stage:?}");
        assert_eq!(info.pending_viewers, 0, "stage {stage:?}");
        wait_until("viewer rollback", || media.live_endpoints() == 1).await;
        assert_eq!(media.live_pipelines(), 1);

        // The viewer may try again
        media.set_fail_at(None);
        viewer.join_with_offer("room1", VIEWER_OFFER).await;
        expect_join_response(&mut viewer).await;

        relay.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_timeout_rolls_back() {
    let media = MockMediaServer::builder()
        .offer_delay(Duration::from_secs(60))
        .build();
    let relay = spawn_media_relay_with(
        &media,
        RelaySettings {
            negotiation_timeout: Duration::from_secs(1),
            ..RelaySettings::default()
        },
    );
    let mut broadcaster = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    broadcaster.expect_error(NEGOTIATION).await;

    assert_eq!(relay.get_status().await.unwrap().broadcast_count, 0);
    media.wait_for_no_leaks().await;

    relay.cancel();
}

// ============================================================================
// Reservations and stale completions
// ============================================================================

#[tokio::test]
async fn test_stop_during_negotiation_releases_late_result() {
    let media = MockMediaServer::builder()
        .offer_delay(Duration::from_millis(100))
        .build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    broadcaster.stop(None).await;
    assert_eq!(
        broadcaster.recv().await,
        ServerEvent::StopResponse {
            message: "Broadcast stopped".to_string()
        }
    );

    wait_until("negotiation to finish", || media.endpoints_created() == 1).await;
    media.wait_for_no_leaks().await;

    // The late answer is never delivered
    broadcaster.expect_no_event().await;
    assert_eq!(relay.get_status().await.unwrap().broadcast_count, 0);

    relay.cancel();
}

#[tokio::test]
async fn test_viewer_disconnect_during_negotiation_releases_endpoint() {
    let media = MockMediaServer::builder().build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;
    let viewer = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    expect_start_response(&mut broadcaster).await;

    media.set_offer_delay(Some(Duration::from_millis(100)));
    viewer.join_with_offer("room1", VIEWER_OFFER).await;
    viewer.disconnect().await;

    wait_until("viewer negotiation", || media.endpoints_created() == 2).await;
    wait_until("stale endpoint release", || media.live_endpoints() == 1).await;

    let info = relay.get_broadcast(BroadcastId::new("room1")).await.unwrap();
    assert!(info.viewers.is_empty());
    assert_eq!(info.pending_viewers, 0);

    relay.cancel();
}

#[tokio::test]
async fn test_reserved_broadcast_blocks_start_and_join() {
    let media = MockMediaServer::builder()
        .offer_delay(Duration::from_millis(100))
        .build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;
    let mut rival = TestClient::connect(&relay).await;
    let mut viewer = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    settle(&relay).await;

    let info = relay.get_broadcast(BroadcastId::new("room1")).await.unwrap();
    assert!(info.is_pending);
    assert!(!info.has_media);

    rival.start("room1", BROADCASTER_OFFER).await;
    rival.expect_error(CONFLICT).await;

    viewer.join_with_offer("room1", VIEWER_OFFER).await;
    viewer.expect_error(NOT_FOUND).await;

    expect_start_response(&mut broadcaster).await;
    assert_eq!(media.pipelines_created(), 1);

    relay.cancel();
}

#[tokio::test]
async fn test_duplicate_start_always_rejected_with_media() {
    let media = MockMediaServer::builder().build();
    let relay = spawn_media_relay(&media);
    let mut first = TestClient::connect(&relay).await;
    let mut second = TestClient::connect(&relay).await;

    first.start("room1", BROADCASTER_OFFER).await;
    expect_start_response(&mut first).await;

    second.start("room1", BROADCASTER_OFFER).await;
    second.expect_error(CONFLICT).await;
    assert_eq!(media.pipelines_created(), 1);

    relay.cancel();
}

// ============================================================================
// Candidates
// ============================================================================

#[tokio::test]
async fn test_candidates_buffered_until_confirmed() {
    let media = MockMediaServer::builder()
        .offer_delay(Duration::from_millis(50))
        .build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    broadcaster.ice_candidate("room1", candidate(1)).await;
    broadcaster.ice_candidate("room1", candidate(2)).await;

    expect_start_response(&mut broadcaster).await;
    wait_until("buffered candidates flushed", || {
        media.candidates_added(1).len() == 2
    })
    .await;

    // Later candidates go straight to the endpoint
    broadcaster.ice_candidate("room1", candidate(3)).await;
    wait_until("direct candidate", || media.candidates_added(1).len() == 3).await;
    assert!(media.candidates_added(1).contains(&candidate(3)));

    relay.cancel();
}

#[tokio::test]
async fn test_viewer_candidate_goes_to_viewer_endpoint() {
    let media = MockMediaServer::builder().build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;
    let mut viewer = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    expect_start_response(&mut broadcaster).await;
    viewer.join_with_offer("room1", VIEWER_OFFER).await;
    expect_join_response(&mut viewer).await;

    viewer.ice_candidate("room1", candidate(5)).await;
    wait_until("viewer candidate", || media.candidates_added(2).len() == 1).await;
    assert!(media.candidates_added(1).is_empty());

    // Not relayed to the broadcaster as signaling
    broadcaster.expect_no_event().await;

    relay.cancel();
}

#[tokio::test]
async fn test_candidate_from_non_member_rejected() {
    let media = MockMediaServer::builder().build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;
    let mut stranger = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    expect_start_response(&mut broadcaster).await;

    stranger.ice_candidate("room1", candidate(1)).await;
    stranger.expect_error(BAD_REQUEST).await;

    stranger.ice_candidate("nope", candidate(1)).await;
    stranger.expect_error(NOT_FOUND).await;

    relay.cancel();
}

// ============================================================================
// Protocol rules in media mode
// ============================================================================

#[tokio::test]
async fn test_join_requires_offer_and_answer_is_rejected() {
    let media = MockMediaServer::builder().build();
    let relay = spawn_media_relay(&media);
    let mut broadcaster = TestClient::connect(&relay).await;
    let mut viewer = TestClient::connect(&relay).await;

    broadcaster.start("room1", BROADCASTER_OFFER).await;
    expect_start_response(&mut broadcaster).await;

    viewer.join("room1").await;
    viewer.expect_error(BAD_REQUEST).await;

    viewer.answer("room1", VIEWER_ANSWER).await;
    viewer.expect_error(BAD_REQUEST).await;

    assert_eq!(media.endpoints_created(), 1);
    relay.cancel();
}

#[tokio::test]
async fn test_shutdown_releases_all_media() {
    let media = MockMediaServer::builder().build();
    let relay = spawn_media_relay(&media);
    let mut first = TestClient::connect(&relay).await;
    let mut second = TestClient::connect(&relay).await;
    let mut viewer = TestClient::connect(&relay).await;

    first.start("room1", BROADCASTER_OFFER).await;
    second.start("room2", BROADCASTER_OFFER).await;
    expect_start_response(&mut first).await;
    expect_start_response(&mut second).await;
    viewer.join_with_offer("room1", VIEWER_OFFER).await;
    expect_join_response(&mut viewer).await;

    relay.shutdown().await.unwrap();

    assert_eq!(
        viewer.recv().await,
        ServerEvent::BroadcastEnded {
            broadcast_id: BroadcastId::new("room1")
        }
    );
    media.wait_for_no_leaks().await;
}
