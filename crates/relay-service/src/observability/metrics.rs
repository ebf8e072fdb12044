//! Metrics definitions for the broadcast relay.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded; broadcast and connection IDs are never used as labels:
//! - `event`: 5 values (start, join, answer, ice_candidate, disconnect_request)
//! - `kind`: bounded by `RelayError::kind()` (9 values)
//! - `role`: 2 values (broadcaster, viewer)
//! - `outcome`: 2 values (success, error)
//! - `actor_type`: 2 values (relay, connection) on drop and panic counters

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle for
/// serving `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Negotiation spans several collaborator round trips
        .set_buckets_for_metric(
            Matcher::Prefix("relay_negotiation".to_string()),
            &[
                0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set negotiation buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Set the number of sessions (active or reserved).
///
/// Metric: `relay_broadcasts_active`
pub fn set_broadcasts_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_broadcasts_active").set(count as f64);
}

/// Set the number of confirmed viewers across all broadcasts.
///
/// Metric: `relay_viewers_active`
pub fn set_viewers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_viewers_active").set(count as f64);
}

/// Set the number of registered signaling connections.
///
/// Metric: `relay_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Set the relay actor's mailbox depth.
///
/// Metric: `relay_mailbox_depth`
///
/// Per-connection queues are not exported here; their overflows show up in
/// `relay_messages_dropped_total` and `relay_connections_evicted_total`.
pub fn set_relay_mailbox_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_mailbox_depth").set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Record an inbound signaling event.
///
/// Metric: `relay_events_total`
/// Labels: `event`
pub fn record_event(event: &'static str) {
    counter!("relay_events_total", "event" => event).increment(1);
}

/// Record an event that was answered with an `error`.
///
/// Metric: `relay_event_errors_total`
/// Labels: `kind`
pub fn record_event_error(kind: &'static str) {
    counter!("relay_event_errors_total", "kind" => kind).increment(1);
}

/// Record an outbound message dropped because the connection's queue was
/// full or closed.
///
/// Metric: `relay_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("relay_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record a connection evicted because its outbound queue overflowed.
///
/// Metric: `relay_connections_evicted_total`
pub fn record_connection_evicted() {
    counter!("relay_connections_evicted_total").increment(1);
}

/// Record an actor panic.
///
/// Metric: `relay_actor_panics_total`
/// Labels: `actor_type`
///
/// Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("relay_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Record a media negotiation attempt.
///
/// Metric: `relay_negotiation_duration_seconds`
/// Labels: `role`, `outcome`
pub fn record_negotiation(role: &'static str, duration: Duration, success: bool) {
    let outcome = if success { "success" } else { "error" };
    histogram!("relay_negotiation_duration_seconds",
        "role" => role,
        "outcome" => outcome
    )
    .record(duration.as_secs_f64());
}
