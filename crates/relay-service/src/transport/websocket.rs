//! WebSocket signaling endpoint (`GET /signaling`).

use crate::actors::{OutboundReceiver, RelayActorHandle};
use crate::signaling::ServerEvent;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::types::ConnectionId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Build the signaling router.
pub fn signaling_router(relay: RelayActorHandle) -> Router {
    Router::new()
        .route("/signaling", get(ws_handler))
        .with_state(relay)
        .layer(TraceLayer::new_for_http())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<RelayActorHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Serve one signaling connection until either side closes it.
///
/// The relay is told about the disconnect exactly once, whichever half of
/// the socket finishes first.
pub async fn handle_socket(mut socket: WebSocket, relay: RelayActorHandle) {
    let (connection_id, outbound) = match relay.connect().await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(
                target: "relay.transport",
                error = %e,
                "Connection refused"
            );
            if let Ok(json) = ServerEvent::from_error(&e).to_json() {
                let _ = socket.send(Message::Text(json)).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(
        target: "relay.transport",
        connection_id = %connection_id,
        "WebSocket client connected"
    );

    let (ws_tx, ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(connection_id, ws_tx, outbound));
    let reader = read_loop(&relay, connection_id, ws_rx);

    tokio::select! {
        _ = &mut writer => {},
        () = reader => {},
    }

    if let Err(e) = relay.disconnect(connection_id).await {
        debug!(
            target: "relay.transport",
            connection_id = %connection_id,
            error = %e,
            "Relay gone before disconnect was delivered"
        );
    }
    writer.abort();

    info!(
        target: "relay.transport",
        connection_id = %connection_id,
        "WebSocket client disconnected"
    );
}

/// Hand inbound frames to the relay, in order, until the client goes away.
async fn read_loop(
    relay: &RelayActorHandle,
    connection_id: ConnectionId,
    mut ws_rx: SplitStream<WebSocket>,
) {
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
            Ok(Message::Close(_)) => break,
            // axum answers pings itself
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(e) => {
                debug!(
                    target: "relay.transport",
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket read failed"
                );
                break;
            }
        };

        if relay.dispatch_frame(connection_id, &text).await.is_err() {
            // Relay stopped; nothing left to serve
            break;
        }
    }
}

/// Write queued events to the socket until the relay drops the queue or the
/// socket fails.
async fn write_loop(
    connection_id: ConnectionId,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: OutboundReceiver,
) {
    while let Some(event) = outbound.recv().await {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(
                    target: "relay.transport",
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to encode outbound event"
                );
                continue;
            }
        };

        if ws_tx.send(Message::Text(json)).await.is_err() {
            debug!(
                target: "relay.transport",
                connection_id = %connection_id,
                "WebSocket write failed"
            );
            return;
        }
    }

    // Relay released the connection (shutdown)
    let _ = ws_tx.send(Message::Close(None)).await;
}
