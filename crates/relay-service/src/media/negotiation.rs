//! Negotiation pipelines for broadcaster and viewer endpoints.
//!
//! Each attempt is a short sequential pipeline. Every stage is bounded by the
//! negotiation timeout, and a failure at any stage releases everything the
//! attempt allocated before the error is returned:
//!
//! ```text
//! broadcaster: create_pipeline -> create_endpoint -> process_offer -> gather_candidates
//!                   |  failure at any later stage: release pipeline
//! viewer:      create_endpoint -> process_offer -> gather_candidates -> connect(source, viewer)
//!                   |  failure at any later stage: release endpoint
//! ```
//!
//! These functions never touch the session registry. They run in spawned
//! tasks and hand their outcome back to the relay actor, which confirms or
//! rolls back the reservation it made before spawning them.

use super::{
    CandidateSink, MediaEndpoint, MediaError, MediaPipeline, MediaResources, MediaServer,
};
use crate::observability::metrics::record_negotiation;
use crate::signaling::IceCandidate;

use common::types::BroadcastId;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Outcome of a successful broadcaster negotiation.
pub struct BroadcasterNegotiation {
    /// Pipeline and broadcaster endpoint, to be owned by the session.
    pub resources: MediaResources,
    /// Answer for the broadcaster's offer.
    pub sdp_answer: String,
    /// Candidates discovered by the broadcaster endpoint.
    pub candidates: mpsc::UnboundedReceiver<IceCandidate>,
}

/// Outcome of a successful viewer negotiation.
pub struct ViewerNegotiation {
    /// The viewer's endpoint, connected to the broadcaster endpoint.
    pub endpoint: Arc<dyn MediaEndpoint>,
    /// Answer for the viewer's offer.
    pub sdp_answer: String,
    /// Candidates discovered by the viewer endpoint.
    pub candidates: mpsc::UnboundedReceiver<IceCandidate>,
}

impl std::fmt::Debug for BroadcasterNegotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcasterNegotiation")
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ViewerNegotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerNegotiation")
            .field("endpoint", &self.endpoint.id())
            .finish_non_exhaustive()
    }
}

/// Run one collaborator call under the negotiation timeout.
async fn stage<T, F>(name: &'static str, limit: Duration, fut: F) -> Result<T, MediaError>
where
    F: Future<Output = Result<T, MediaError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MediaError::Timeout(name)),
    }
}

/// Build the pipeline and broadcaster endpoint for a new broadcast.
#[instrument(skip_all, name = "relay.negotiation.broadcaster", fields(broadcast_id = %broadcast_id))]
pub async fn negotiate_broadcaster(
    server: &dyn MediaServer,
    broadcast_id: &BroadcastId,
    sdp_offer: &str,
    limit: Duration,
) -> Result<BroadcasterNegotiation, MediaError> {
    let started = Instant::now();
    let pipeline = stage("create_pipeline", limit, server.create_pipeline()).await?;

    let (sink, candidates) = mpsc::unbounded_channel();
    let result = build_endpoint(&*pipeline, sdp_offer, sink, limit).await;

    match result {
        Ok((endpoint, sdp_answer)) => {
            record_negotiation("broadcaster", started.elapsed(), true);
            debug!(
                target: "relay.negotiation",
                broadcast_id = %broadcast_id,
                pipeline_id = %pipeline.id(),
                endpoint_id = %endpoint.id(),
                "Broadcaster endpoint negotiated"
            );
            Ok(BroadcasterNegotiation {
                resources: MediaResources { pipeline, endpoint },
                sdp_answer,
                candidates,
            })
        }
        Err(e) => {
            record_negotiation("broadcaster", started.elapsed(), false);
            warn!(
                target: "relay.negotiation",
                broadcast_id = %broadcast_id,
                error = %e,
                "Broadcaster negotiation failed, releasing pipeline"
            );
            release_pipeline(&*pipeline).await;
            Err(e)
        }
    }
}

/// Create a viewer endpoint on the broadcast's pipeline and connect the
/// broadcaster endpoint to it.
#[instrument(skip_all, name = "relay.negotiation.viewer", fields(broadcast_id = %broadcast_id))]
pub async fn negotiate_viewer(
    resources: &MediaResources,
    broadcast_id: &BroadcastId,
    sdp_offer: &str,
    limit: Duration,
) -> Result<ViewerNegotiation, MediaError> {
    let started = Instant::now();
    let (sink, candidates) = mpsc::unbounded_channel();

    let (endpoint, sdp_answer) =
        match build_endpoint(&*resources.pipeline, sdp_offer, sink, limit).await {
            Ok(built) => built,
            Err(e) => {
                record_negotiation("viewer", started.elapsed(), false);
                return Err(e);
            }
        };

    if let Err(e) = stage(
        "connect",
        limit,
        resources.endpoint.connect(&*endpoint),
    )
    .await
    {
        record_negotiation("viewer", started.elapsed(), false);
        warn!(
            target: "relay.negotiation",
            broadcast_id = %broadcast_id,
            endpoint_id = %endpoint.id(),
            error = %e,
            "Viewer endpoint connection failed, releasing endpoint"
        );
        release_endpoint(&*endpoint).await;
        return Err(e);
    }

    record_negotiation("viewer", started.elapsed(), true);
    debug!(
        target: "relay.negotiation",
        broadcast_id = %broadcast_id,
        endpoint_id = %endpoint.id(),
        "Viewer endpoint negotiated"
    );

    Ok(ViewerNegotiation {
        endpoint,
        sdp_answer,
        candidates,
    })
}

/// Create an endpoint, process the offer and start gathering candidates.
///
/// Releases the endpoint if any stage after its creation fails.
async fn build_endpoint(
    pipeline: &dyn MediaPipeline,
    sdp_offer: &str,
    sink: CandidateSink,
    limit: Duration,
) -> Result<(Arc<dyn MediaEndpoint>, String), MediaError> {
    let endpoint = stage("create_endpoint", limit, pipeline.create_endpoint()).await?;

    let negotiated = async {
        let sdp_answer = stage("process_offer", limit, endpoint.process_offer(sdp_offer)).await?;
        stage("gather_candidates", limit, endpoint.gather_candidates(sink)).await?;
        Ok(sdp_answer)
    }
    .await;

    match negotiated {
        Ok(sdp_answer) => Ok((endpoint, sdp_answer)),
        Err(e) => {
            release_endpoint(&*endpoint).await;
            Err(e)
        }
    }
}

/// Release a pipeline, swallowing (but logging) failures.
pub async fn release_pipeline(pipeline: &dyn MediaPipeline) {
    if let Err(e) = pipeline.release().await {
        warn!(
            target: "relay.negotiation",
            pipeline_id = %pipeline.id(),
            error = %e,
            "Pipeline release failed"
        );
    }
}

/// Release an endpoint, swallowing (but logging) failures.
pub async fn release_endpoint(endpoint: &dyn MediaEndpoint) {
    if let Err(e) = endpoint.release().await {
        warn!(
            target: "relay.negotiation",
            endpoint_id = %endpoint.id(),
            error = %e,
            "Endpoint release failed"
        );
    }
}

/// Release a pipeline from a detached task (fire-and-forget teardown).
pub fn spawn_release_pipeline(pipeline: Arc<dyn MediaPipeline>) {
    tokio::spawn(async move {
        release_pipeline(&*pipeline).await;
    });
}

/// Release an endpoint from a detached task (fire-and-forget teardown).
pub fn spawn_release_endpoint(endpoint: Arc<dyn MediaEndpoint>) {
    tokio::spawn(async move {
        release_endpoint(&*endpoint).await;
    });
}

/// Add a client candidate to an endpoint from a detached task.
pub fn spawn_add_candidate(endpoint: Arc<dyn MediaEndpoint>, candidate: IceCandidate) {
    tokio::spawn(async move {
        if let Err(e) = endpoint.add_candidate(candidate).await {
            warn!(
                target: "relay.negotiation",
                endpoint_id = %endpoint.id(),
                error = %e,
                "Adding remote candidate failed"
            );
        }
    });
}
