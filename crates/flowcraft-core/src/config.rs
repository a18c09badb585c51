//! Collaboration settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Default topic namespace prepended to room ids.
pub const DEFAULT_TOPIC_PREFIX: &str = "flowcraft-";
/// Default signaling endpoint for the relay transport.
pub const DEFAULT_SIGNALING_ENDPOINT: &str = "ws://localhost:4444/ws";
/// Default maximum number of peers per room.
pub const DEFAULT_MAX_PEERS: usize = 20;
/// Default flush interval for buffered node positions.
pub const DEFAULT_POSITION_FLUSH_MS: u64 = 50;
/// Default flush interval for buffered cursor updates.
pub const DEFAULT_CURSOR_FLUSH_MS: u64 = 50;
/// Default age after which a silent peer's presence is dropped.
pub const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 30_000;

/// Settings shared by every room joined through a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Signaling endpoints, tried in order by the relay transport.
    pub signaling_endpoints: Vec<String>,
    /// Namespace prepended to the room id to form the transport topic.
    pub topic_prefix: String,
    /// Upper bound on peers in one room.
    pub max_peers: usize,
    /// Throttle interval for drag updates.
    pub position_flush_ms: u64,
    /// Throttle interval for cursor broadcasts.
    pub cursor_flush_ms: u64,
    /// Presence records older than this are pruned.
    pub presence_timeout_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            signaling_endpoints: vec![DEFAULT_SIGNALING_ENDPOINT.to_string()],
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            max_peers: DEFAULT_MAX_PEERS,
            position_flush_ms: DEFAULT_POSITION_FLUSH_MS,
            cursor_flush_ms: DEFAULT_CURSOR_FLUSH_MS,
            presence_timeout_ms: DEFAULT_PRESENCE_TIMEOUT_MS,
        }
    }
}

impl CollabConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that intervals and limits are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1".into()));
        }
        if self.position_flush_ms == 0 || self.cursor_flush_ms == 0 {
            return Err(ConfigError::Invalid("flush intervals must be non-zero".into()));
        }
        Ok(())
    }

    /// Transport topic for a room.
    pub fn topic_for(&self, room_id: &str) -> String {
        format!("{}{}", self.topic_prefix, room_id)
    }

    pub fn position_flush_interval(&self) -> Duration {
        Duration::from_millis(self.position_flush_ms)
    }

    pub fn cursor_flush_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_flush_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.max_peers, 20);
        assert_eq!(config.position_flush_interval(), Duration::from_millis(50));
        assert_eq!(config.topic_for("abc"), "flowcraft-abc");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CollabConfig::from_json(r#"{"max_peers": 4, "topic_prefix": "t/"}"#).unwrap();
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.topic_prefix, "t/");
        assert_eq!(config.cursor_flush_ms, DEFAULT_CURSOR_FLUSH_MS);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = CollabConfig::from_json(r#"{"position_flush_ms": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
