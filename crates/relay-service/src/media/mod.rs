//! Delegated media collaborator.
//!
//! When the relay owns media resources, pipeline creation, offer processing,
//! candidate gathering and endpoint interconnection are performed by an
//! external media server. The relay only sees it through these traits; all
//! operations are asynchronous and fallible.
//!
//! # Ownership
//!
//! - One pipeline per broadcast, owned by the broadcast's session.
//! - One endpoint for the broadcaster and one per viewer, all created on that
//!   pipeline.
//! - Releasing the pipeline tears down every endpoint created on it.
//!
//! # Modules
//!
//! - [`negotiation`] - Broadcaster and viewer negotiation pipelines with
//!   rollback on stage failure

pub mod negotiation;

use crate::signaling::IceCandidate;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Sink for candidates discovered by an endpoint.
pub type CandidateSink = mpsc::UnboundedSender<IceCandidate>;

/// Errors reported by the media collaborator.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Media server could not be reached.
    #[error("Media server unavailable: {0}")]
    Unavailable(String),

    /// Pipeline creation failed.
    #[error("Media pipeline error: {0}")]
    Pipeline(String),

    /// Endpoint creation failed.
    #[error("Endpoint creation error: {0}")]
    Endpoint(String),

    /// Offer processing failed.
    #[error("Error processing offer: {0}")]
    ProcessOffer(String),

    /// Candidate gathering or adding failed.
    #[error("Candidate error: {0}")]
    Candidate(String),

    /// Endpoint interconnection failed.
    #[error("Error connecting endpoints: {0}")]
    Connect(String),

    /// Releasing a resource failed.
    #[error("Release error: {0}")]
    Release(String),

    /// A collaborator call did not complete in time.
    #[error("Media operation timed out: {0}")]
    Timeout(&'static str),
}

/// Entry point to the media server.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Create a new media pipeline.
    async fn create_pipeline(&self) -> Result<Arc<dyn MediaPipeline>, MediaError>;
}

/// A media pipeline hosting the endpoints of one broadcast.
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    /// Collaborator-assigned identifier, for logs.
    fn id(&self) -> &str;

    /// Create a new endpoint on this pipeline.
    async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError>;

    /// Release the pipeline and every endpoint created on it.
    async fn release(&self) -> Result<(), MediaError>;
}

/// A media endpoint negotiating one client's media path.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Collaborator-assigned identifier, for logs.
    fn id(&self) -> &str;

    /// Process the client's offer and return the answer.
    async fn process_offer(&self, sdp_offer: &str) -> Result<String, MediaError>;

    /// Start gathering candidates. Discovered candidates are pushed to
    /// `sink` for as long as the endpoint lives.
    async fn gather_candidates(&self, sink: CandidateSink) -> Result<(), MediaError>;

    /// Add a remote candidate received from the client.
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Connect this endpoint's outgoing media to `sink`.
    async fn connect(&self, sink: &dyn MediaEndpoint) -> Result<(), MediaError>;

    /// Release this endpoint.
    async fn release(&self) -> Result<(), MediaError>;
}

/// Media resources owned by one broadcast session.
#[derive(Clone)]
pub struct MediaResources {
    /// The broadcast's pipeline.
    pub pipeline: Arc<dyn MediaPipeline>,
    /// The broadcaster's endpoint.
    pub endpoint: Arc<dyn MediaEndpoint>,
}

impl std::fmt::Debug for MediaResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaResources")
            .field("pipeline", &self.pipeline.id())
            .field("endpoint", &self.endpoint.id())
            .finish()
    }
}
