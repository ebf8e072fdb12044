//! Signaling client driven directly through a `RelayActorHandle`.
//!
//! Stands in for a WebSocket connection: it registers with the relay, sends
//! `ClientEvent`s and reads the `ServerEvent`s queued for it.

use common::types::{BroadcastId, ConnectionId};
use relay_service::actors::{OutboundReceiver, RelayActorHandle};
use relay_service::signaling::{ClientEvent, IceCandidate, ServerEvent};
use std::time::Duration;

/// How long `recv` waits before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A connected test client.
#[derive(Debug)]
pub struct TestClient {
    id: ConnectionId,
    relay: RelayActorHandle,
    outbound: OutboundReceiver,
}

impl TestClient {
    /// Register a new connection with the relay.
    pub async fn connect(relay: &RelayActorHandle) -> Self {
        let (id, outbound) = relay.connect().await.expect("relay refused connection");
        Self {
            id,
            relay: relay.clone(),
            outbound,
        }
    }

    /// This client's connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send an event.
    pub async fn send(&self, event: ClientEvent) {
        self.relay
            .dispatch(self.id, event)
            .await
            .expect("relay mailbox closed");
    }

    /// Send a raw text frame, as the transport would.
    pub async fn send_frame(&self, text: &str) {
        self.relay
            .dispatch_frame(self.id, text)
            .await
            .expect("relay mailbox closed");
    }

    pub async fn start(&self, broadcast_id: &str, sdp_offer: &str) {
        self.send(ClientEvent::Start {
            broadcast_id: BroadcastId::new(broadcast_id),
            sdp_offer: sdp_offer.to_string(),
        })
        .await;
    }

    /// Join without an offer (signaling mode).
    pub async fn join(&self, broadcast_id: &str) {
        self.send(ClientEvent::Join {
            broadcast_id: BroadcastId::new(broadcast_id),
            sdp_offer: None,
        })
        .await;
    }

    /// Join with an offer (media mode).
    pub async fn join_with_offer(&self, broadcast_id: &str, sdp_offer: &str) {
        self.send(ClientEvent::Join {
            broadcast_id: BroadcastId::new(broadcast_id),
            sdp_offer: Some(sdp_offer.to_string()),
        })
        .await;
    }

    pub async fn answer(&self, broadcast_id: &str, sdp_answer: &str) {
        self.send(ClientEvent::Answer {
            broadcast_id: BroadcastId::new(broadcast_id),
            sdp_answer: sdp_answer.to_string(),
        })
        .await;
    }

    pub async fn ice_candidate(&self, broadcast_id: &str, candidate: IceCandidate) {
        self.send(ClientEvent::IceCandidate {
            broadcast_id: BroadcastId::new(broadcast_id),
            candidate,
        })
        .await;
    }

    /// Explicit stop (broadcaster) or leave (viewer).
    pub async fn stop(&self, broadcast_id: Option<&str>) {
        self.send(ClientEvent::DisconnectRequest {
            broadcast_id: broadcast_id.map(BroadcastId::new),
        })
        .await;
    }

    /// Transport-level disconnect. The client keeps its receiver so tests
    /// can check nothing more arrives.
    pub async fn disconnect(&self) {
        self.relay
            .disconnect(self.id)
            .await
            .expect("relay mailbox closed");
    }

    /// Wait for the next event.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives within `RECV_TIMEOUT` or the queue closed.
    pub async fn recv(&mut self) -> ServerEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .unwrap_or_else(|_| panic!("client {} timed out waiting for an event", self.id))
            .unwrap_or_else(|| panic!("client {} outbound queue closed", self.id))
    }

    /// Wait for the next event and check it is an `error` with `code`.
    pub async fn expect_error(&mut self, code: i32) -> String {
        match self.recv().await {
            ServerEvent::Error { message, code: got } => {
                assert_eq!(got, code, "unexpected error code ({message})");
                message
            }
            other => panic!("expected error {code}, got {other:?}"),
        }
    }

    /// Assert that nothing is queued once the relay has processed every
    /// message sent before this call.
    pub async fn expect_no_event(&mut self) {
        settle(&self.relay).await;
        if let Ok(event) = self.outbound.try_recv() {
            panic!("client {} got unexpected event {event:?}", self.id);
        }
    }

    /// Whether the relay has dropped this client's outbound queue.
    pub async fn is_released(&mut self) -> bool {
        matches!(
            tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv()).await,
            Ok(None)
        )
    }
}

/// Wait until the relay has processed everything queued before this call and
/// spawned tasks have had a chance to run.
pub async fn settle(relay: &RelayActorHandle) {
    // Round trip through the mailbox orders us after earlier messages
    let _ = relay.get_status().await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let _ = relay.get_status().await;
}
