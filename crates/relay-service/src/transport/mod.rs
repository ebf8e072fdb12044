//! Client-facing transport.
//!
//! Signaling runs over WebSocket text frames. The transport owns nothing but
//! the socket: every frame is handed to the relay actor in arrival order, and
//! every event the relay queues for the connection is written back out.

pub mod websocket;

pub use websocket::{handle_socket, signaling_router};
