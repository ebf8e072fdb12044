//! Observability for the broadcast relay.
//!
//! Logging goes through `tracing` with `relay.*` targets. Instrumented
//! functions use `#[instrument(skip_all)]` and allow-list safe fields
//! explicitly: session descriptions and candidates are never logged.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_broadcasts_active` | Gauge | none | Current sessions |
//! | `relay_viewers_active` | Gauge | none | Current confirmed viewers |
//! | `relay_connections_active` | Gauge | none | Current signaling connections |
//! | `relay_mailbox_depth` | Gauge | none | Relay actor backpressure |
//! | `relay_events_total` | Counter | `event` | Inbound signaling events |
//! | `relay_event_errors_total` | Counter | `kind` | Events answered with `error` |
//! | `relay_messages_dropped_total` | Counter | `actor_type` | Outbound backpressure drops |
//! | `relay_connections_evicted_total` | Counter | none | Slow clients disconnected |
//! | `relay_actor_panics_total` | Counter | `actor_type` | Actor task panics |
//! | `relay_negotiation_duration_seconds` | Histogram | `role`, `outcome` | Media negotiation time |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, Phase};
pub use metrics::init_metrics_recorder;
