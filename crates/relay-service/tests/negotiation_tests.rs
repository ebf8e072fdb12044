//! Tests for the broadcaster and viewer negotiation pipelines.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::BroadcastId;
use relay_service::media::negotiation::{negotiate_broadcaster, negotiate_viewer};
use relay_service::media::MediaError;
use relay_test_utils::*;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(1);

fn room() -> BroadcastId {
    BroadcastId::new("room1")
}

#[tokio::test]
async fn test_broadcaster_negotiation_success() {
    let media = MockMediaServer::builder().candidates_per_endpoint(3).build();

    let mut negotiation = negotiate_broadcaster(&media, &room(), BROADCASTER_OFFER, LIMIT)
        .await
        .unwrap();

    assert!(negotiation.sdp_answer.ends_with(BROADCASTER_OFFER));
    for _ in 0..3 {
        assert!(negotiation.candidates.recv().await.is_some());
    }
    assert_eq!(media.live_pipelines(), 1);
    assert_eq!(media.live_endpoints(), 1);
}

#[tokio::test]
async fn test_broadcaster_failure_releases_everything() {
    for stage in [
        FailAt::CreatePipeline,
        FailAt::CreateEndpoint,
        FailAt::ProcessOffer,
        FailAt::GatherCandidates,
    ] {
        let media = MockMediaServer::builder().fail_at(stage).build();

        let result = negotiate_broadcaster(&media, &room(), BROADCASTER_OFFER, LIMIT).await;

        assert!(result.is_err(), "stage {stage:?}");
        // Releases happen before the error is returned
        assert_eq!(media.live_pipelines(), 0, "stage {stage:?}");
        assert_eq!(media.live_endpoints(), 0, "stage {stage:?}");
    }
}

#[tokio::test]
async fn test_viewer_connect_failure_releases_only_viewer_endpoint() {
    let media = MockMediaServer::builder().build();
    let broadcaster = negotiate_broadcaster(&media, &room(), BROADCASTER_OFFER, LIMIT)
        .await
        .unwrap();

    media.set_fail_at(Some(FailAt::Connect));
    let result = negotiate_viewer(&broadcaster.resources, &room(), VIEWER_OFFER, LIMIT).await;

    assert!(matches!(result, Err(MediaError::Connect(_))));
    assert_eq!(media.endpoints_created(), 2);
    assert_eq!(media.endpoints_released(), 1);
    assert_eq!(media.live_pipelines(), 1);
    assert_eq!(media.live_endpoints(), 1);
}

#[tokio::test]
async fn test_viewer_is_connected_to_broadcaster_endpoint() {
    let media = MockMediaServer::builder().build();
    let broadcaster = negotiate_broadcaster(&media, &room(), BROADCASTER_OFFER, LIMIT)
        .await
        .unwrap();

    let viewer = negotiate_viewer(&broadcaster.resources, &room(), VIEWER_OFFER, LIMIT)
        .await
        .unwrap();

    assert_eq!(
        media.connections(),
        vec![(
            broadcaster.resources.endpoint.id().to_string(),
            viewer.endpoint.id().to_string()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout() {
    let media = MockMediaServer::builder()
        .offer_delay(Duration::from_secs(30))
        .build();

    let result = negotiate_broadcaster(&media, &room(), BROADCASTER_OFFER, LIMIT).await;

    assert!(matches!(result, Err(MediaError::Timeout("process_offer"))));
    assert_eq!(media.live_pipelines(), 0);
}
