//! Actor model implementation for the relay.
//!
//! ```text
//! RelayActor (singleton per relay instance)
//! ├── owns the SessionRegistry and ConnectionRouter
//! ├── holds one ConnectionHandle per signaling connection
//! │   └── bounded outbound queue, drained by the transport
//! └── spawns negotiation tasks (media mode) that report back by message
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer**: every registry/router mutation happens inside the `RelayActor`
//! - **Non-blocking fan-out**: events to clients use `try_send`; a full queue drops and counts
//! - **Attempt numbers**: negotiation results that lost a race with stop/disconnect are
//!   recognised as stale and their resources released
//! - **CancellationToken propagation**: servers run on child tokens of the relay's root token
//!
//! # Modules
//!
//! - [`relay`] - `RelayActor` singleton, the event dispatcher
//! - [`connection`] - Outbound handle per signaling connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod relay;

// Re-export primary types
pub use connection::{ConnectionHandle, OutboundReceiver};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use relay::{RelayActor, RelayActorHandle, RelaySettings};
