//! Relay configuration.
//!
//! Configuration is loaded from environment variables. Every variable has a
//! default; values that are present but unparseable are rejected rather than
//! silently replaced.

use common::config::ObservabilityConfig;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health/metrics endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default maximum number of concurrent broadcasts.
pub const DEFAULT_MAX_BROADCASTS: usize = 1000;

/// Default maximum number of viewers per broadcast.
pub const DEFAULT_MAX_VIEWERS_PER_BROADCAST: usize = 500;

/// Default bound on each media collaborator call, in seconds.
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECONDS: u64 = 10;

/// Default relay instance ID prefix.
pub const DEFAULT_RELAY_ID_PREFIX: &str = "relay";

/// What to do with a `start` for a broadcast ID that is already running.
///
/// Relays that own media always reject, whatever this is set to: the running
/// session's pipeline cannot be shared with a second broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateStartPolicy {
    /// First broadcaster wins; the duplicate is dropped without a reply.
    #[default]
    Ignore,
    /// The duplicate gets an `AlreadyExists` error.
    Reject,
}

impl DuplicateStartPolicy {
    /// Returns the policy as its configuration string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DuplicateStartPolicy::Ignore => "ignore",
            DuplicateStartPolicy::Reject => "reject",
        }
    }
}

impl FromStr for DuplicateStartPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(DuplicateStartPolicy::Ignore),
            "reject" => Ok(DuplicateStartPolicy::Reject),
            other => Err(ConfigError::InvalidValue(format!(
                "RELAY_DUPLICATE_START must be 'ignore' or 'reject', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DuplicateStartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this relay instance, used in logs.
    pub relay_id: String,

    /// Duplicate `start` handling for signaling-only relays.
    pub duplicate_start: DuplicateStartPolicy,

    /// Maximum concurrent broadcasts.
    pub max_broadcasts: usize,

    /// Maximum viewers (confirmed and negotiating) per broadcast.
    pub max_viewers_per_broadcast: usize,

    /// Bound on each media collaborator call, in seconds.
    pub negotiation_timeout_seconds: u64,

    /// Logging configuration.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RELAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let duplicate_start = match vars.get("RELAY_DUPLICATE_START") {
            Some(value) => value.parse()?,
            None => DuplicateStartPolicy::default(),
        };

        let max_broadcasts =
            parse_positive(vars, "RELAY_MAX_BROADCASTS", DEFAULT_MAX_BROADCASTS)?;

        let max_viewers_per_broadcast = parse_positive(
            vars,
            "RELAY_MAX_VIEWERS_PER_BROADCAST",
            DEFAULT_MAX_VIEWERS_PER_BROADCAST,
        )?;

        let negotiation_timeout_seconds = parse_positive(
            vars,
            "RELAY_NEGOTIATION_TIMEOUT_SECONDS",
            DEFAULT_NEGOTIATION_TIMEOUT_SECONDS,
        )?;

        let json_logs = match vars.get("RELAY_LOG_JSON") {
            Some(value) => parse_bool("RELAY_LOG_JSON", value)?,
            None => false,
        };

        let relay_id = vars.get("RELAY_ID").cloned().unwrap_or_else(|| {
            let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RELAY_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            health_bind_address,
            relay_id,
            duplicate_start,
            max_broadcasts,
            max_viewers_per_broadcast,
            negotiation_timeout_seconds,
            observability: ObservabilityConfig {
                json_logs,
                ..ObservabilityConfig::default()
            },
        })
    }

    /// Bound on each media collaborator call.
    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_seconds)
    }
}

/// Parse a numeric variable that must be greater than zero.
fn parse_positive<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };

    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => Ok(value),
        Ok(_) => Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than zero"
        ))),
        Err(_) => Err(ConfigError::InvalidValue(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!(
            "{name} must be true or false, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.duplicate_start, DuplicateStartPolicy::Ignore);
        assert_eq!(config.max_broadcasts, DEFAULT_MAX_BROADCASTS);
        assert_eq!(
            config.max_viewers_per_broadcast,
            DEFAULT_MAX_VIEWERS_PER_BROADCAST
        );
        assert_eq!(
            config.negotiation_timeout(),
            Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECONDS)
        );
        assert!(!config.observability.json_logs);
        // Relay ID should be auto-generated
        assert!(config.relay_id.starts_with("relay-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:3001".to_string()),
            (
                "RELAY_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:8082".to_string(),
            ),
            ("RELAY_ID".to_string(), "relay-custom-001".to_string()),
            ("RELAY_DUPLICATE_START".to_string(), "Reject".to_string()),
            ("RELAY_MAX_BROADCASTS".to_string(), "20".to_string()),
            (
                "RELAY_MAX_VIEWERS_PER_BROADCAST".to_string(),
                "3".to_string(),
            ),
            (
                "RELAY_NEGOTIATION_TIMEOUT_SECONDS".to_string(),
                "2".to_string(),
            ),
            ("RELAY_LOG_JSON".to_string(), "true".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:3001");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.relay_id, "relay-custom-001");
        assert_eq!(config.duplicate_start, DuplicateStartPolicy::Reject);
        assert_eq!(config.max_broadcasts, 20);
        assert_eq!(config.max_viewers_per_broadcast, 3);
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(2));
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_invalid_duplicate_start_policy() {
        let vars = HashMap::from([("RELAY_DUPLICATE_START".to_string(), "replace".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("replace")));
    }

    #[test]
    fn test_zero_limits_rejected() {
        for name in [
            "RELAY_MAX_BROADCASTS",
            "RELAY_MAX_VIEWERS_PER_BROADCAST",
            "RELAY_NEGOTIATION_TIMEOUT_SECONDS",
        ] {
            let vars = HashMap::from([(name.to_string(), "0".to_string())]);
            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(ref msg)) if msg.contains(name)),
                "{name}=0 should be rejected"
            );
        }
    }

    #[test]
    fn test_unparseable_numbers_rejected() {
        let vars = HashMap::from([("RELAY_MAX_BROADCASTS".to_string(), "lots".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let vars = HashMap::from([("RELAY_LOG_JSON".to_string(), "maybe".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_duplicate_start_policy_round_trip() {
        for policy in [DuplicateStartPolicy::Ignore, DuplicateStartPolicy::Reject] {
            assert_eq!(policy.to_string().parse::<DuplicateStartPolicy>().unwrap(), policy);
        }
    }
}
