//! Common configuration types for the broadcast relay.

use serde::{Deserialize, Serialize};

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log filter used when `RUST_LOG` is not set
    pub log_level: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "relay_service=debug,tower_http=debug".to_string(),
            json_logs: false,
        }
    }
}
