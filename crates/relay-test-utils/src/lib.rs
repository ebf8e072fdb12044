//! # Relay Test Utilities
//!
//! Shared test utilities for the broadcast relay.
//!
//! ## Modules
//!
//! - `mock_media` - Scriptable in-memory media server with leak accounting
//! - `test_client` - Signaling client driven through a `RelayActorHandle`
//! - `fixtures` - SDP and candidate test data
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let media = MockMediaServer::builder().fail_at(FailAt::Connect).build();
//!     let relay = spawn_media_relay(&media);
//!
//!     let mut broadcaster = TestClient::connect(&relay).await;
//!     broadcaster.start("room1", BROADCASTER_OFFER).await;
//!     // ...
//!     assert_eq!(media.live_pipelines(), 0);
//! }
//! ```

pub mod fixtures;
pub mod mock_media;
pub mod test_client;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_media::*;
pub use test_client::*;
