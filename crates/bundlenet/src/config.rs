//! Node configuration.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use bundlenet_sync::{ExchangeConfig, Role};

use crate::error::{NodeError, Result};

/// Which part a node plays in the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Endpoint,
    Backend,
    Relay,
}

impl NodeRole {
    /// The bundle engine role, if this node runs one.
    pub fn engine_role(self) -> Option<Role> {
        match self {
            NodeRole::Endpoint => Some(Role::Endpoint),
            NodeRole::Backend => Some(Role::Backend),
            NodeRole::Relay => None,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeRole::Endpoint => "endpoint",
            NodeRole::Backend => "backend",
            NodeRole::Relay => "relay",
        })
    }
}

/// How received ADUs reach the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// A callback sees each ADU as soon as its bundle is absorbed.
    #[default]
    Inline,
    /// ADUs wait in the ledger until the host calls `drain`.
    Poll,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub mode: DeliveryMode,
}

/// Configuration for a [`crate::Node`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub exchange: ExchangeConfig,
    pub delivery: DeliveryConfig,
}

impl NodeConfig {
    pub fn endpoint() -> Self {
        Self::with_role(NodeRole::Endpoint)
    }

    pub fn backend() -> Self {
        Self::with_role(NodeRole::Backend)
    }

    pub fn relay() -> Self {
        Self::with_role(NodeRole::Relay)
    }

    fn with_role(role: NodeRole) -> Self {
        Self {
            role,
            ..Default::default()
        }
    }

    /// Poll for received ADUs instead of receiving them inline.
    pub fn polling(mut self) -> Self {
        self.delivery.mode = DeliveryMode::Poll;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.exchange
            .validate()
            .map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = NodeConfig::from_json_str(r#"{"role": "relay"}"#).unwrap();
        assert_eq!(config.role, NodeRole::Relay);
        assert_eq!(config.exchange, ExchangeConfig::default());
        assert_eq!(config.delivery.mode, DeliveryMode::Inline);
    }

    #[test]
    fn test_json_overrides_exchange_settings() {
        let json = r#"{
            "role": "backend",
            "exchange": {"download_probe_window": 3, "transfer_timeout": {"secs": 5, "nanos": 0}},
            "delivery": {"mode": "poll"}
        }"#;
        let config = NodeConfig::from_json_str(json).unwrap();
        assert_eq!(config.role, NodeRole::Backend);
        assert_eq!(config.exchange.download_probe_window, 3);
        assert_eq!(config.exchange.transfer_timeout, Duration::from_secs(5));
        assert_eq!(config.delivery.mode, DeliveryMode::Poll);
    }

    #[test]
    fn test_invalid_exchange_settings_rejected() {
        let err = NodeConfig::from_json_str(r#"{"exchange": {"chunk_size": 0}}"#).unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn test_unknown_role_is_parse_error() {
        let err = NodeConfig::from_json_str(r#"{"role": "satellite"}"#).unwrap_err();
        assert!(matches!(err, NodeError::ConfigParse(_)));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let config = NodeConfig::relay().polling();
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        assert_eq!(NodeConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = NodeConfig::from_json_file("/nonexistent/bundlenet.json").unwrap_err();
        assert!(matches!(err, NodeError::ConfigRead(_)));
    }

    #[test]
    fn test_engine_roles() {
        assert_eq!(NodeRole::Endpoint.engine_role(), Some(Role::Endpoint));
        assert_eq!(NodeRole::Relay.engine_role(), None);
        assert_eq!(NodeRole::Backend.to_string(), "backend");
    }
}
