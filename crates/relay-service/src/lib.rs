//! Broadcast Relay Service Library
//!
//! Signaling relay for one-to-many audio/video broadcasts. A broadcaster
//! opens a broadcast with an offer; viewers join it and the relay ferries
//! offers, answers and connectivity candidates between the right parties.
//! Media itself never passes through this crate: it is either peer-to-peer
//! (signaling-only mode) or terminated by an external media server reached
//! through the [`media`] traits.
//!
//! # Architecture
//!
//! ```text
//! transport (one task per WebSocket)
//! └── RelayActorHandle ──mpsc──> RelayActor (singleton)
//!                                 ├── SessionRegistry   broadcast id -> session
//!                                 ├── ConnectionRouter  connection -> membership
//!                                 ├── ConnectionHandle  per connection outbound queue
//!                                 └── negotiation tasks (media mode only)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Relay actor (event dispatcher), connection handles, mailbox metrics
//! - [`registry`] - Session Registry
//! - [`router`] - Connection Router
//! - [`signaling`] - JSON wire protocol
//! - [`media`] - Media server collaborator traits and negotiation pipelines
//! - [`transport`] - WebSocket signaling endpoint
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing error codes
//! - [`observability`] - Health probes and Prometheus metrics

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod registry;
pub mod router;
pub mod signaling;
pub mod transport;
