//! In-memory media server for relay testing.
//!
//! The mock can be configured to:
//! - Fail one negotiation stage (`FailAt`)
//! - Delay offer processing (to race negotiations against stop/disconnect)
//! - Emit a fixed number of candidates per endpoint when gathering starts
//!
//! Every pipeline and endpoint it hands out is tracked, so tests can assert
//! that nothing leaked: an endpoint is live until it is released or its
//! pipeline is.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_test_utils::{FailAt, MockMediaServer};
//!
//! let media = MockMediaServer::builder()
//!     .fail_at(FailAt::ProcessOffer)
//!     .candidates_per_endpoint(2)
//!     .build();
//!
//! // ... drive the relay ...
//! assert_eq!(media.live_pipelines(), 0);
//! assert_eq!(media.live_endpoints(), 0);
//! ```

use async_trait::async_trait;
use relay_service::media::{
    CandidateSink, MediaEndpoint, MediaError, MediaPipeline, MediaServer,
};
use relay_service::signaling::IceCandidate;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Negotiation stage at which the mock fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    CreatePipeline,
    CreateEndpoint,
    ProcessOffer,
    GatherCandidates,
    Connect,
}

#[derive(Default)]
struct MockState {
    fail_at: Mutex<Option<FailAt>>,
    offer_delay: Mutex<Option<Duration>>,
    candidates_per_endpoint: usize,
    next_id: AtomicUsize,
    pipelines: Mutex<Vec<Arc<PipelineState>>>,
    endpoints: Mutex<Vec<Arc<MockEndpoint>>>,
    connections: Mutex<Vec<(String, String)>>,
}

impl MockState {
    fn fails_at(&self, stage: FailAt) -> bool {
        *self.fail_at.lock().unwrap() == Some(stage)
    }

    fn next_id(&self, kind: &str) -> String {
        format!("{kind}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[derive(Debug)]
struct PipelineState {
    id: String,
    released: AtomicBool,
}

/// Scriptable media server. Cloning shares state.
#[derive(Debug, Clone, Default)]
pub struct MockMediaServer {
    state: Arc<MockState>,
}

impl MockMediaServer {
    /// Create a new `MockMediaServer` builder.
    #[must_use]
    pub fn builder() -> MockMediaServerBuilder {
        MockMediaServerBuilder::default()
    }

    /// Change (or clear) the failing stage for subsequent calls.
    pub fn set_fail_at(&self, stage: Option<FailAt>) {
        *self.state.fail_at.lock().unwrap() = stage;
    }

    /// Change (or clear) the offer processing delay for subsequent calls.
    pub fn set_offer_delay(&self, delay: Option<Duration>) {
        *self.state.offer_delay.lock().unwrap() = delay;
    }

    /// This server as the trait object the relay takes.
    #[must_use]
    pub fn as_server(&self) -> Arc<dyn MediaServer> {
        Arc::new(self.clone())
    }

    /// Pipelines created so far.
    #[must_use]
    pub fn pipelines_created(&self) -> usize {
        self.state.pipelines.lock().unwrap().len()
    }

    /// Pipelines not yet released.
    #[must_use]
    pub fn live_pipelines(&self) -> usize {
        self.state
            .pipelines
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.released.load(Ordering::SeqCst))
            .count()
    }

    /// Endpoints created so far.
    #[must_use]
    pub fn endpoints_created(&self) -> usize {
        self.state.endpoints.lock().unwrap().len()
    }

    /// Endpoints neither released themselves nor torn down with their pipeline.
    #[must_use]
    pub fn live_endpoints(&self) -> usize {
        self.state
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_live())
            .count()
    }

    /// Endpoints released individually (not through their pipeline).
    #[must_use]
    pub fn endpoints_released(&self) -> usize {
        self.state
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.released.load(Ordering::SeqCst))
            .count()
    }

    /// `(source, sink)` endpoint ID pairs connected so far.
    #[must_use]
    pub fn connections(&self) -> Vec<(String, String)> {
        self.state.connections.lock().unwrap().clone()
    }

    /// Remote candidates added to the `index`th created endpoint (1-based
    /// creation order: the broadcaster's endpoint is usually 1).
    #[must_use]
    pub fn candidates_added(&self, index: usize) -> Vec<IceCandidate> {
        self.state
            .endpoints
            .lock()
            .unwrap()
            .get(index - 1)
            .map(|e| e.added.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Wait (up to a second) until no pipeline or endpoint is live.
    ///
    /// Releases run in spawned tasks, so tests poll for them to land.
    pub async fn wait_for_no_leaks(&self) {
        for _ in 0..100 {
            if self.live_pipelines() == 0 && self.live_endpoints() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "media leaked: {} live pipelines, {} live endpoints",
            self.live_pipelines(),
            self.live_endpoints()
        );
    }
}

#[async_trait]
impl MediaServer for MockMediaServer {
    async fn create_pipeline(&self) -> Result<Arc<dyn MediaPipeline>, MediaError> {
        if self.state.fails_at(FailAt::CreatePipeline) {
            return Err(MediaError::Pipeline("mock pipeline failure".to_string()));
        }

        let pipeline = Arc::new(PipelineState {
            id: self.state.next_id("pipeline"),
            released: AtomicBool::new(false),
        });
        self.state
            .pipelines
            .lock()
            .unwrap()
            .push(Arc::clone(&pipeline));

        Ok(Arc::new(MockPipeline {
            state: Arc::clone(&self.state),
            pipeline,
        }))
    }
}

struct MockPipeline {
    state: Arc<MockState>,
    pipeline: Arc<PipelineState>,
}

#[async_trait]
impl MediaPipeline for MockPipeline {
    fn id(&self) -> &str {
        &self.pipeline.id
    }

    async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        if self.state.fails_at(FailAt::CreateEndpoint) {
            return Err(MediaError::Endpoint("mock endpoint failure".to_string()));
        }

        let endpoint = Arc::new(MockEndpoint {
            id: self.state.next_id("endpoint"),
            state: Arc::clone(&self.state),
            pipeline: Arc::clone(&self.pipeline),
            released: AtomicBool::new(false),
            sink: Mutex::new(None),
            added: Mutex::new(Vec::new()),
        });
        self.state
            .endpoints
            .lock()
            .unwrap()
            .push(Arc::clone(&endpoint));

        Ok(endpoint as Arc<dyn MediaEndpoint>)
    }

    async fn release(&self) -> Result<(), MediaError> {
        self.pipeline.released.store(true, Ordering::SeqCst);
        // Endpoints die with their pipeline; drop their candidate sinks
        for endpoint in self.state.endpoints.lock().unwrap().iter() {
            if Arc::ptr_eq(&endpoint.pipeline, &self.pipeline) {
                endpoint.sink.lock().unwrap().take();
            }
        }
        Ok(())
    }
}

/// Endpoint handed out by the mock.
#[derive(Debug)]
pub struct MockEndpoint {
    id: String,
    state: Arc<MockState>,
    pipeline: Arc<PipelineState>,
    released: AtomicBool,
    sink: Mutex<Option<CandidateSink>>,
    added: Mutex<Vec<IceCandidate>>,
}

impl MockEndpoint {
    fn is_live(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && !self.pipeline.released.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockState").finish_non_exhaustive()
    }
}

#[async_trait]
impl MediaEndpoint for MockEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process_offer(&self, sdp_offer: &str) -> Result<String, MediaError> {
        let delay = *self.state.offer_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fails_at(FailAt::ProcessOffer) {
            return Err(MediaError::ProcessOffer("mock offer failure".to_string()));
        }
        Ok(format!("answer-from-{}-for-{sdp_offer}", self.id))
    }

    async fn gather_candidates(&self, sink: CandidateSink) -> Result<(), MediaError> {
        if self.state.fails_at(FailAt::GatherCandidates) {
            return Err(MediaError::Candidate("mock gathering failure".to_string()));
        }
        for n in 1..=self.state.candidates_per_endpoint {
            let _ = sink.send(IceCandidate::new(format!("candidate:{}:{n}", self.id)));
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.added.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn connect(&self, sink: &dyn MediaEndpoint) -> Result<(), MediaError> {
        if self.state.fails_at(FailAt::Connect) {
            return Err(MediaError::Connect("mock connect failure".to_string()));
        }
        self.state
            .connections
            .lock()
            .unwrap()
            .push((self.id.clone(), sink.id().to_string()));
        Ok(())
    }

    async fn release(&self) -> Result<(), MediaError> {
        self.released.store(true, Ordering::SeqCst);
        self.sink.lock().unwrap().take();
        Ok(())
    }
}

/// Builder for `MockMediaServer`.
#[derive(Debug, Default)]
pub struct MockMediaServerBuilder {
    fail_at: Option<FailAt>,
    offer_delay: Option<Duration>,
    candidates_per_endpoint: usize,
}

impl MockMediaServerBuilder {
    /// Fail every call at `stage`.
    #[must_use]
    pub fn fail_at(mut self, stage: FailAt) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Delay every `process_offer` call.
    #[must_use]
    pub fn offer_delay(mut self, delay: Duration) -> Self {
        self.offer_delay = Some(delay);
        self
    }

    /// Emit `count` candidates from each endpoint when gathering starts.
    #[must_use]
    pub fn candidates_per_endpoint(mut self, count: usize) -> Self {
        self.candidates_per_endpoint = count;
        self
    }

    /// Build the `MockMediaServer`.
    #[must_use]
    pub fn build(self) -> MockMediaServer {
        MockMediaServer {
            state: Arc::new(MockState {
                fail_at: Mutex::new(self.fail_at),
                offer_delay: Mutex::new(self.offer_delay),
                candidates_per_endpoint: self.candidates_per_endpoint,
                ..MockState::default()
            }),
        }
    }
}
